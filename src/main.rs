mod config;
mod console;
mod dates;
mod error;
mod export;
mod icloud_client;
mod library;
mod model;
mod preflight;

use std::path::PathBuf;

use clap::Parser;
use dialoguer::{Input, Password};
use git_version::git_version;
use tracing_subscriber::EnvFilter;

use crate::config::{ExportConfig, RunMode};
use crate::console::ConsoleObserver;
use crate::error::AuthError;
use crate::export::MatchAction;
use crate::icloud_client::{Endpoints, ICloudClient};

pub const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Largest `--page-size`; each page asks CloudKit for twice as many records.
const MAX_PAGE_SIZE: i64 = 500;

/// Export iCloud Photos taken within a date range
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Apple ID email address
    #[clap(short, long)]
    username: String,

    /// Apple ID password; prompted for when omitted
    #[clap(short, long)]
    password: Option<String>,

    /// First day or moment to include: YYYY-MM-DD or "YYYY-MM-DD HH:MM:SS"
    #[clap(short, long, required_unless_present = "browse")]
    start_date: Option<String>,

    /// Last day to include, or the moment to stop before
    #[clap(short, long, required_unless_present = "browse")]
    end_date: Option<String>,

    #[clap(short, long, default_value = "./downloaded_photos")]
    download_dir: PathBuf,

    /// Stop after this many downloads
    #[clap(short, long)]
    max_downloads: Option<u64>,

    /// Show matching items without downloading them
    #[clap(short, long)]
    list_only: bool,

    #[clap(short, long)]
    quiet: bool,

    /// List the first N items of the library without filtering
    #[clap(long, value_name = "N")]
    browse: Option<usize>,

    /// Time zone used to compare, display and name items, as hours from UTC
    #[clap(
        long,
        default_value_t = dates::DEFAULT_UTC_OFFSET_HOURS,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i32).range(-12..=14)
    )]
    utc_offset_hours: i32,

    /// Items requested per library page
    #[clap(
        long,
        default_value_t = 100,
        value_parser = clap::value_parser!(u16).range(1..=MAX_PAGE_SIZE)
    )]
    page_size: u16,
}

fn init_logging(quiet: bool) {
    let default_filter = if quiet {
        "warn"
    } else {
        "icloud_photo_export=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Signs in, prompting for anything not supplied on the command line.
async fn sign_in(config: &ExportConfig) -> anyhow::Result<ICloudClient> {
    let password = match &config.password {
        Some(password) => password.clone(),
        None => tokio::task::block_in_place(|| {
            Password::new().with_prompt("iCloud password").interact()
        })?,
    };

    let mut client = ICloudClient::new(Endpoints::default())?;
    match client.login(&config.username, &password).await {
        Ok(()) => {}
        Err(AuthError::TwoFactorRequired) => {
            println!("Two-factor authentication is required.");
            let code: String = tokio::task::block_in_place(|| {
                Input::new()
                    .with_prompt("Code from your trusted device")
                    .interact_text()
            })?;
            client.verify_two_factor(&code).await?;
        }
        Err(e) => return Err(e.into()),
    }
    if !client.is_authenticated() {
        anyhow::bail!("sign-in finished without access to iCloud Photos");
    }

    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);

    println!("iCloud Photo Export {GIT_VERSION}");

    let config = ExportConfig::from_args(&args)?;
    if let Some(dir) = config.download_dir() {
        preflight::check_download_dir(dir)?;
    }

    let client = sign_in(&config).await?;

    match &config.mode {
        RunMode::Browse { limit } => {
            let entries =
                export::list_library(&client, *limit, &config.normalizer, config.page_size).await;
            for (index, entry) in entries.iter().enumerate() {
                println!("{n}. {entry}", n = index + 1);
            }
            println!("Listed {count} items.", count = entries.len());
        }
        RunMode::Export { window, options } => {
            println!("Searching for media from {window}...");
            let list_only = options.action == MatchAction::ListOnly;
            let mut observer = ConsoleObserver::new(config.quiet, list_only);
            let summary = export::export_window(&client, window, options, &mut observer).await;
            observer.finish();

            if summary.matched == 0 {
                println!("No media found in the given date range.");
            }
            println!("Finished: {summary}.");
        }
    }

    Ok(())
}
