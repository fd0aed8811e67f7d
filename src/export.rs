use std::{
    fmt,
    path::{Path, PathBuf},
};

use filetime::FileTime;

use crate::dates::{DateWindow, Normalizer};
use crate::error::{ExportError, GatewayError};
use crate::library::{MediaCursor, PhotoLibrary};
use crate::model::{MediaItem, MediaKind};

/// Items examined between two progress heartbeats.
pub const HEARTBEAT_INTERVAL: u64 = 100;

const FILENAME_PREFIX_FORMAT: &str = "%Y%m%d_%H%M%S_";
const PARTIAL_SUFFIX: &str = "part";

/// A file written during this run.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRecord {
    pub path: PathBuf,
    pub item: MediaItem,
    pub bytes_written: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub examined: u64,
    pub matched: u64,
    pub downloaded: u64,
    pub failed: u64,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined {examined}, matched {matched}, downloaded {downloaded}, failed {failed}",
            examined = self.examined,
            matched = self.matched,
            downloaded = self.downloaded,
            failed = self.failed
        )
    }
}

/// Lightweight description of an item for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub filename: String,
    pub created: String,
    pub dimensions: Option<String>,
    pub size_kb: Option<f64>,
    pub kind: MediaKind,
}

impl ListingEntry {
    pub fn new(item: &MediaItem, normalizer: &Normalizer) -> ListingEntry {
        ListingEntry {
            filename: item.filename.clone(),
            created: normalizer.display(item.created_at),
            dimensions: item.dimensions(),
            size_kb: item.size_kb(),
            kind: item.kind(),
        }
    }
}

impl fmt::Display for ListingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{kind}] {filename} - created {created}, {dimensions}, ",
            kind = self.kind,
            filename = self.filename,
            created = self.created,
            dimensions = self.dimensions.as_deref().unwrap_or("unknown")
        )?;
        match self.size_kb {
            Some(size) => write!(f, "{size:.2} KB"),
            None => write!(f, "unknown size"),
        }
    }
}

/// What happens to each item that falls inside the window.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchAction {
    Download { target_dir: PathBuf },
    ListOnly,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub action: MatchAction,
    /// Stop scanning once this many matches were handled.
    pub max_items: Option<u64>,
    pub page_size: usize,
}

/// Receives progress while a scan runs. All methods default to doing nothing.
pub trait ExportObserver {
    fn scan_started(&mut self, _total: Option<u64>) {}
    fn item_examined(&mut self) {}
    fn heartbeat(&mut self, _examined: u64, _total: Option<u64>) {}
    fn matched(&mut self, _entry: &ListingEntry) {}
    fn downloaded(&mut self, _record: &DownloadRecord) {}
    fn failed(&mut self, _filename: Option<&str>, _error: &ExportError) {}
    fn enumeration_failed(&mut self, _error: &GatewayError) {}
}

/// Destination basename: normalized creation time followed by the remote name.
pub fn destination_filename(item: &MediaItem, normalizer: &Normalizer) -> String {
    let prefix = normalizer
        .normalize(item.created_at)
        .format(FILENAME_PREFIX_FORMAT);
    let base = item.filename.replace(['/', '\\'], "_");
    format!("{prefix}{base}")
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Downloads one item into `target_dir`. Bytes land in a `.part` file first and
/// are renamed into place only once fully written.
pub async fn persist<L: PhotoLibrary + ?Sized>(
    library: &L,
    item: &MediaItem,
    target_dir: &Path,
    normalizer: &Normalizer,
) -> Result<DownloadRecord, ExportError> {
    tokio::fs::create_dir_all(target_dir)
        .await
        .map_err(|source| ExportError::Io {
            path: target_dir.to_path_buf(),
            source,
        })?;

    let destination = target_dir.join(destination_filename(item, normalizer));
    log::debug!("Fetching {id} ({filename})", id = item.id, filename = item.filename);
    let bytes = library.fetch_bytes(item).await?;

    if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
        log::warn!(
            "Overwriting {path}: another item has the same name and timestamp",
            path = destination.display()
        );
    }

    let partial = partial_path(&destination);
    if let Err(source) = write_then_rename(&partial, &destination, &bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(ExportError::Io {
            path: destination,
            source,
        });
    }

    let mtime = FileTime::from_unix_time(item.created_at.timestamp(), 0);
    if let Err(e) = filetime::set_file_mtime(&destination, mtime) {
        log::warn!(
            "Could not set modification time on {path}: {e}",
            path = destination.display()
        );
    }

    Ok(DownloadRecord {
        path: destination,
        item: item.clone(),
        bytes_written: bytes.len() as u64,
    })
}

async fn write_then_rename(partial: &Path, destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(partial, bytes).await?;
    tokio::fs::rename(partial, destination).await
}

/// Scans the whole library once, handling each item inside `window` as soon as
/// it is found. Failures on single items are counted and the scan goes on.
pub async fn export_window<L, O>(
    library: &L,
    window: &DateWindow,
    options: &ExportOptions,
    observer: &mut O,
) -> ExportSummary
where
    L: PhotoLibrary + ?Sized,
    O: ExportObserver + ?Sized,
{
    let mut summary = ExportSummary::default();
    let normalizer = window.normalizer();

    let total = match library.media_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            log::warn!("Could not count library items: {e}");
            None
        }
    };
    observer.scan_started(total);

    let mut cursor = MediaCursor::new(library, options.page_size);
    loop {
        if let Some(max) = options.max_items {
            let handled = match options.action {
                MatchAction::Download { .. } => summary.downloaded,
                MatchAction::ListOnly => summary.matched,
            };
            if handled >= max {
                log::info!("Reached the limit of {max} items, stopping scan");
                break;
            }
        }

        let entry = match cursor.next().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                log::error!("Could not enumerate the library: {e}");
                observer.enumeration_failed(&e);
                break;
            }
        };

        summary.examined += 1;
        observer.item_examined();
        if summary.examined % HEARTBEAT_INTERVAL == 0 {
            observer.heartbeat(summary.examined, total);
        }

        let item = match entry {
            Ok(item) => item,
            Err(e) => {
                summary.failed += 1;
                observer.failed(None, &ExportError::from(e));
                continue;
            }
        };

        if !window.matches(&item) {
            continue;
        }
        summary.matched += 1;
        observer.matched(&ListingEntry::new(&item, normalizer));

        if let MatchAction::Download { target_dir } = &options.action {
            match persist(library, &item, target_dir, normalizer).await {
                Ok(record) => {
                    summary.downloaded += 1;
                    observer.downloaded(&record);
                }
                Err(e) => {
                    summary.failed += 1;
                    observer.failed(Some(item.filename.as_str()), &e);
                }
            }
        }
    }

    summary
}

/// Describes up to `limit` items from the start of the library, unfiltered.
pub async fn list_library<L: PhotoLibrary + ?Sized>(
    library: &L,
    limit: usize,
    normalizer: &Normalizer,
    page_size: usize,
) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let mut cursor = MediaCursor::new(library, page_size.min(limit.max(1)));

    while entries.len() < limit {
        match cursor.next().await {
            Ok(Some(Ok(item))) => entries.push(ListingEntry::new(&item, normalizer)),
            Ok(Some(Err(e))) => log::warn!("Skipping unreadable item: {e}"),
            Ok(None) => break,
            Err(e) => {
                log::error!("Could not enumerate the library: {e}");
                break;
            }
        }
    }

    entries
}
