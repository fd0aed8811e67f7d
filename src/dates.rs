use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::InputError;
use crate::model::MediaItem;

pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Converts creation instants into the single zone used for comparison, display
/// and filenames. Every such use goes through [`Normalizer::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    offset: FixedOffset,
}

impl Normalizer {
    pub fn new(utc_offset_hours: i32) -> Result<Normalizer, InputError> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .ok_or(InputError::InvalidOffset(utc_offset_hours))?;
        Ok(Normalizer { offset })
    }

    pub fn normalize(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }

    /// Reads a wall-clock time as belonging to the target zone.
    pub fn localize(&self, wall_clock: NaiveDateTime) -> DateTime<FixedOffset> {
        self.offset.from_utc_datetime(&(wall_clock - self.offset))
    }

    pub fn display(&self, instant: DateTime<Utc>) -> String {
        self.normalize(instant).format(DISPLAY_FORMAT).to_string()
    }
}

/// A date given on the command line, with or without a time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInput {
    Day(NaiveDate),
    Moment(NaiveDateTime),
}

impl DateInput {
    pub fn parse(input: &str) -> Result<DateInput, InputError> {
        if let Ok(moment) = NaiveDateTime::parse_from_str(input, DATE_TIME_FORMAT) {
            return Ok(DateInput::Moment(moment));
        }
        if let Ok(day) = NaiveDate::parse_from_str(input, DATE_FORMAT) {
            return Ok(DateInput::Day(day));
        }
        Err(InputError::InvalidDate(input.to_string()))
    }

    fn as_start(&self) -> NaiveDateTime {
        match self {
            DateInput::Day(day) => day.and_time(NaiveTime::MIN),
            DateInput::Moment(moment) => *moment,
        }
    }

    /// A bare day extends the window to midnight of the following day.
    fn as_end(&self) -> Result<NaiveDateTime, InputError> {
        match self {
            DateInput::Day(day) => day
                .succ_opt()
                .map(|next| next.and_time(NaiveTime::MIN))
                .ok_or_else(|| InputError::InvalidDate(day.to_string())),
            DateInput::Moment(moment) => Ok(*moment),
        }
    }
}

/// Half-open window `[start, end)` in the normalizer's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
    normalizer: Normalizer,
}

impl DateWindow {
    pub fn new(
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        normalizer: Normalizer,
    ) -> Result<DateWindow, InputError> {
        if start > end {
            return Err(InputError::InvertedWindow {
                start: start.format(DISPLAY_FORMAT).to_string(),
                end: end.format(DISPLAY_FORMAT).to_string(),
            });
        }
        Ok(DateWindow {
            start,
            end,
            normalizer,
        })
    }

    pub fn from_inputs(
        start: DateInput,
        end: DateInput,
        normalizer: Normalizer,
    ) -> Result<DateWindow, InputError> {
        let start = normalizer.localize(start.as_start());
        let end = normalizer.localize(end.as_end()?);
        DateWindow::new(start, end, normalizer)
    }

    pub fn start(&self) -> DateTime<FixedOffset> {
        self.start
    }

    pub fn end(&self) -> DateTime<FixedOffset> {
        self.end
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn contains(&self, normalized: DateTime<FixedOffset>) -> bool {
        self.start <= normalized && normalized < self.end
    }

    pub fn matches(&self, item: &MediaItem) -> bool {
        self.contains(self.normalizer.normalize(item.created_at))
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {} (UTC{})",
            self.start().format(DISPLAY_FORMAT),
            self.end().format(DISPLAY_FORMAT),
            self.start().offset()
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike};

    use super::*;
    use crate::model::tests::item;

    fn kst() -> Normalizer {
        Normalizer::new(9).unwrap()
    }

    fn day(input: &str) -> DateInput {
        DateInput::parse(input).unwrap()
    }

    /// Builds a UTC instant whose normalized (UTC+9) wall clock is the given time.
    fn utc_for_kst(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap() - Duration::hours(9)
    }

    #[test]
    fn normalize_shifts_wall_clock_by_nine_hours() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 5, 5, 30, 0).unwrap();
        let normalized = kst().normalize(instant);

        assert_eq!(14, normalized.hour());
        assert_eq!(instant, normalized.with_timezone(&Utc));
        assert_eq!("2024-03-05 14:30:00", kst().display(instant));
    }

    #[test]
    fn offset_out_of_range_is_rejected() {
        assert!(matches!(
            Normalizer::new(30),
            Err(InputError::InvalidOffset(30))
        ));
    }

    #[test]
    fn parses_both_accepted_formats() {
        assert_eq!(
            DateInput::Day(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            day("2024-01-02")
        );
        assert_eq!(
            DateInput::Moment(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(13, 45, 10)
                    .unwrap()
            ),
            day("2024-01-02 13:45:10")
        );
    }

    #[test]
    fn rejects_other_formats() {
        for input in [
            "2024/01/02",
            "02-01-2024",
            "2024-01-02T10:00:00",
            "yesterday",
            "",
            " 2024-01-02",
            "2024-01-02 ",
            "\t2024-01-02 13:45:10\n",
        ] {
            assert!(
                matches!(DateInput::parse(input), Err(InputError::InvalidDate(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn date_only_end_extends_to_next_midnight() {
        let window = DateWindow::from_inputs(day("2024-01-01"), day("2024-01-02"), kst()).unwrap();

        assert_eq!("2024-01-01 00:00:00", window.start().format(DISPLAY_FORMAT).to_string());
        assert_eq!("2024-01-03 00:00:00", window.end().format(DISPLAY_FORMAT).to_string());

        let last_second = item("a.jpg", utc_for_kst(2024, 1, 2, 23, 59, 59));
        let next_midnight = item("b.jpg", utc_for_kst(2024, 1, 3, 0, 0, 0));
        assert!(window.matches(&last_second));
        assert!(!window.matches(&next_midnight));
    }

    #[test]
    fn window_is_start_inclusive_end_exclusive() {
        let window = DateWindow::from_inputs(
            day("2024-06-01 08:00:00"),
            day("2024-06-01 20:00:00"),
            kst(),
        )
        .unwrap();

        let at_start = item("s.jpg", utc_for_kst(2024, 6, 1, 8, 0, 0));
        let before_start = item("p.jpg", utc_for_kst(2024, 6, 1, 7, 59, 59));
        let before_end = item("e1.jpg", utc_for_kst(2024, 6, 1, 19, 59, 59));
        let at_end = item("e.jpg", utc_for_kst(2024, 6, 1, 20, 0, 0));

        assert!(window.matches(&at_start));
        assert!(!window.matches(&before_start));
        assert!(window.matches(&before_end));
        assert!(!window.matches(&at_end));
    }

    #[test]
    fn comparison_uses_normalized_time_not_utc() {
        // 2024-01-01 20:00 UTC is already 2024-01-02 05:00 in UTC+9.
        let window = DateWindow::from_inputs(day("2024-01-01"), day("2024-01-01"), kst()).unwrap();
        let late_evening_utc = item("x.jpg", Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap());

        assert!(!window.matches(&late_evening_utc));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let result = DateWindow::from_inputs(day("2024-02-01"), day("2024-01-01"), kst());
        assert!(matches!(result, Err(InputError::InvertedWindow { .. })));
    }

    #[test]
    fn empty_window_matches_nothing() {
        let window = DateWindow::from_inputs(
            day("2024-01-01 10:00:00"),
            day("2024-01-01 10:00:00"),
            kst(),
        )
        .unwrap();
        assert!(!window.matches(&item("x.jpg", utc_for_kst(2024, 1, 1, 10, 0, 0))));
    }
}
