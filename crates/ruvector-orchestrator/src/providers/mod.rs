//! Page-processing collaborators
//!
//! The orchestrator drives documents through OCR, refinement and indexing but
//! does none of that work itself. A [`DocumentProcessor`] performs one unit of
//! work per call; calls are synchronous and may be slow, so the orchestrator
//! always runs them on the blocking pool.

pub mod plain_text;

#[cfg(test)]
pub(crate) mod scripted;

pub use plain_text::PlainTextProcessor;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Text recovered from one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    /// 1-based page number
    pub page_number: u32,
    pub text: String,
}

/// Per-unit-of-work processing contract
pub trait DocumentProcessor: Send + Sync + 'static {
    /// Processor name for logs
    fn name(&self) -> &str;

    /// Number of pages in the document
    fn page_count(&self, source: &Path) -> anyhow::Result<u32>;

    /// Extract the text of one page
    fn ocr_page(&self, source: &Path, page: u32) -> anyhow::Result<PageContent>;

    /// Refine OCR output (vision-language model pass)
    fn refine_page(&self, source: &Path, content: PageContent) -> anyhow::Result<PageContent>;

    /// Write one page to the index
    fn index_page(&self, source: &Path, content: &PageContent) -> anyhow::Result<()>;

    /// Called once after every page was indexed
    fn finalize(&self, _source: &Path, _total_pages: u32) -> anyhow::Result<()> {
        Ok(())
    }
}
