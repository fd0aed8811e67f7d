use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{ExportError, GatewayError};
use crate::export::{DownloadRecord, ExportObserver, ListingEntry};

const BAR_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}";

/// Renders scan progress on the terminal.
pub struct ConsoleObserver {
    progress: ProgressBar,
    quiet: bool,
    list_matches: bool,
}

impl ConsoleObserver {
    pub fn new(quiet: bool, list_matches: bool) -> ConsoleObserver {
        let progress = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            progress.set_style(style);
        }

        ConsoleObserver {
            progress,
            quiet,
            list_matches,
        }
    }

    fn line(&self, message: String) {
        if self.progress.is_hidden() {
            println!("{message}");
        } else {
            self.progress.println(message);
        }
    }

    pub fn finish(&self) {
        self.progress.finish_and_clear();
    }
}

impl ExportObserver for ConsoleObserver {
    fn scan_started(&mut self, total: Option<u64>) {
        match total {
            Some(total) => {
                self.progress.set_length(total);
                self.line(format!("Checking {total} media items..."));
            }
            None => self.line("Checking media items...".to_string()),
        }
    }

    fn item_examined(&mut self) {
        self.progress.inc(1);
    }

    fn heartbeat(&mut self, examined: u64, total: Option<u64>) {
        let message = match total {
            Some(total) => format!("Progress: {examined}/{total} checked..."),
            None => format!("Progress: {examined} checked..."),
        };
        self.line(message);
    }

    fn matched(&mut self, entry: &ListingEntry) {
        if self.list_matches {
            self.line(entry.to_string());
        } else if !self.quiet {
            self.progress.set_message(format!("downloading {}", entry.filename));
        }
    }

    fn downloaded(&mut self, record: &DownloadRecord) {
        if !self.quiet {
            self.line(format!(
                "Downloaded {name} -> {path} ({bytes} bytes)",
                name = record.item.filename,
                path = record.path.display(),
                bytes = record.bytes_written
            ));
        }
    }

    fn failed(&mut self, filename: Option<&str>, error: &ExportError) {
        match filename {
            Some(filename) => self.line(format!(
                "Failed to download '{filename}': {error}",
                error = error.describe()
            )),
            None => self.line(format!(
                "Skipped unreadable item: {error}",
                error = error.describe()
            )),
        }
    }

    fn enumeration_failed(&mut self, error: &GatewayError) {
        self.line(format!("Could not read the photo library: {error}"));
    }
}
