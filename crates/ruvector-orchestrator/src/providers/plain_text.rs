//! Plain-text document processor
//!
//! Treats a text file as a document whose pages are separated by form feeds
//! (`\x0c`). Indexed pages are kept in memory.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use super::{DocumentProcessor, PageContent};

const PAGE_BREAK: char = '\u{c}';

/// One page stored in the in-memory index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPage {
    pub source: PathBuf,
    pub page_number: u32,
    pub text: String,
}

/// Reference processor for form-feed separated text files
#[derive(Default)]
pub struct PlainTextProcessor {
    index: Mutex<Vec<IndexedPage>>,
}

impl PlainTextProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything indexed so far
    pub fn indexed_pages(&self) -> Vec<IndexedPage> {
        self.index.lock().clone()
    }

    fn read_pages(source: &Path) -> anyhow::Result<Vec<String>> {
        let raw = std::fs::read(source)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text.split(PAGE_BREAK).map(str::to_string).collect())
    }
}

impl DocumentProcessor for PlainTextProcessor {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn page_count(&self, source: &Path) -> anyhow::Result<u32> {
        let pages = Self::read_pages(source)?;
        u32::try_from(pages.len()).context("Too many pages")
    }

    fn ocr_page(&self, source: &Path, page: u32) -> anyhow::Result<PageContent> {
        let pages = Self::read_pages(source)?;
        let Some(text) = page
            .checked_sub(1)
            .and_then(|index| pages.get(index as usize))
        else {
            bail!("Page {} out of range ({} pages)", page, pages.len());
        };

        Ok(PageContent {
            page_number: page,
            text: text.clone(),
        })
    }

    fn refine_page(&self, _source: &Path, content: PageContent) -> anyhow::Result<PageContent> {
        let text = content.text.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(PageContent { text, ..content })
    }

    fn index_page(&self, source: &Path, content: &PageContent) -> anyhow::Result<()> {
        if content.text.trim().is_empty() {
            return Ok(());
        }

        self.index.lock().push(IndexedPage {
            source: source.to_path_buf(),
            page_number: content.page_number,
            text: content.text.clone(),
        });
        Ok(())
    }

    fn finalize(&self, source: &Path, total_pages: u32) -> anyhow::Result<()> {
        let indexed = self
            .index
            .lock()
            .iter()
            .filter(|page| page.source == source)
            .count();
        tracing::debug!(
            "Indexed {}/{} pages of {}",
            indexed,
            total_pages,
            source.display()
        );
        Ok(())
    }
}
