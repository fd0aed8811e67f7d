use std::path::PathBuf;

use thiserror::Error;

/// Failures while establishing an authenticated iCloud session.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid Apple ID or password")]
    InvalidCredentials,

    /// The account needs a code from a trusted device before the session is usable.
    #[error("two-factor authentication is required")]
    TwoFactorRequired,

    #[error("the two-factor code was rejected")]
    InvalidTwoFactorCode,

    /// Legacy two-step verification accounts must use an app-specific password.
    #[error(
        "this account requires an app-specific password; create one in your Apple ID settings"
    )]
    AppPasswordRequired,

    #[error("unexpected response from {endpoint}: {status}")]
    UnexpectedResponse { endpoint: String, status: u16 },

    #[error("no two-factor challenge is pending")]
    NoPendingChallenge,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failures talking to the photo library once a session exists.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Per-item failure while exporting a single media item.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("could not write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    /// One-line description including the underlying I/O cause.
    pub fn describe(&self) -> String {
        match self {
            ExportError::Io { source, .. } => format!("{self}: {source}"),
            ExportError::Gateway(e) => e.to_string(),
        }
    }
}

/// Fatal problems with the values given on the command line.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid date '{0}': expected 'YYYY-MM-DD' or 'YYYY-MM-DD HH:MM:SS'")]
    InvalidDate(String),

    #[error("start date {start} is after end date {end}")]
    InvertedWindow { start: String, end: String },

    #[error("invalid UTC offset: {0} hours")]
    InvalidOffset(i32),
}

/// Pre-flight capability check failures.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("could not create download directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("download directory {path} is not writable")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
