use crate::Args;
use crate::dates::{DateInput, DateWindow, Normalizer};
use crate::error::InputError;
use crate::export::{ExportOptions, MatchAction};

/// What the run does once signed in.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Describe the first `limit` items without filtering.
    Browse { limit: usize },
    Export {
        window: DateWindow,
        options: ExportOptions,
    },
}

/// Validated settings for one run.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub username: String,
    pub password: Option<String>,
    pub normalizer: Normalizer,
    pub page_size: usize,
    pub quiet: bool,
    pub mode: RunMode,
}

impl ExportConfig {
    pub fn from_args(args: &Args) -> Result<ExportConfig, InputError> {
        let normalizer = Normalizer::new(args.utc_offset_hours)?;
        let page_size = usize::from(args.page_size);

        let mode = match args.browse {
            Some(limit) => RunMode::Browse { limit },
            None => {
                let start = DateInput::parse(args.start_date.as_deref().unwrap_or_default())?;
                let end = DateInput::parse(args.end_date.as_deref().unwrap_or_default())?;
                let window = DateWindow::from_inputs(start, end, normalizer)?;
                let action = if args.list_only {
                    MatchAction::ListOnly
                } else {
                    MatchAction::Download {
                        target_dir: args.download_dir.clone(),
                    }
                };
                RunMode::Export {
                    window,
                    options: ExportOptions {
                        action,
                        max_items: args.max_downloads,
                        page_size,
                    },
                }
            }
        };

        Ok(ExportConfig {
            username: args.username.clone(),
            password: args.password.clone(),
            normalizer,
            page_size,
            quiet: args.quiet,
            mode,
        })
    }

    /// Directory that must be writable before signing in, if any.
    pub fn download_dir(&self) -> Option<&std::path::Path> {
        match &self.mode {
            RunMode::Export {
                options:
                    ExportOptions {
                        action: MatchAction::Download { target_dir },
                        ..
                    },
                ..
            } => Some(target_dir.as_path()),
            _ => None,
        }
    }
}
