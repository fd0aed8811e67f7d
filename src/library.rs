use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::model::{MediaItem, MediaPage};

/// The remote photo library, as seen through an authenticated session.
#[async_trait]
pub trait PhotoLibrary {
    /// Total number of items, used only for progress display.
    async fn media_count(&self) -> Result<u64, GatewayError>;

    /// Fetches the page of items starting at `offset`.
    async fn fetch_page(&self, offset: u64, limit: usize) -> Result<MediaPage, GatewayError>;

    /// Downloads the full original payload of an item.
    async fn fetch_bytes(&self, item: &MediaItem) -> Result<Vec<u8>, GatewayError>;
}

/// Lazily walks a library one page at a time, in whatever order the library
/// yields items.
pub struct MediaCursor<'a, L: PhotoLibrary + ?Sized> {
    library: &'a L,
    page_size: usize,
    offset: u64,
    buffered: VecDeque<Result<MediaItem, GatewayError>>,
    exhausted: bool,
}

impl<'a, L: PhotoLibrary + ?Sized> MediaCursor<'a, L> {
    pub fn new(library: &'a L, page_size: usize) -> MediaCursor<'a, L> {
        MediaCursor {
            library,
            page_size: page_size.max(1),
            offset: 0,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The outer error means the library could not be enumerated further; the
    /// inner one belongs to a single item.
    pub async fn next(&mut self) -> Result<Option<Result<MediaItem, GatewayError>>, GatewayError> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Ok(Some(entry));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self.library.fetch_page(self.offset, self.page_size).await?;
            log::debug!(
                "Fetched page at offset {offset}: {ranks} ranks, {items} items",
                offset = self.offset,
                ranks = page.ranks,
                items = page.items.len()
            );
            if page.end_of_library {
                self.exhausted = true;
            } else if page.ranks == 0 {
                return Err(GatewayError::Malformed(format!(
                    "page at offset {offset} has records but no media",
                    offset = self.offset
                )));
            }
            self.offset += page.ranks;
            self.buffered.extend(page.items);
        }
    }
}
