//! Job submission types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether a submission is a single document or a container of documents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Document,
    Batch,
}

impl JobKind {
    /// Directories and `.zip` archives are batches, everything else is a document.
    pub fn detect(source: &Path) -> Self {
        if source.is_dir() || crate::processing::is_archive(source) {
            JobKind::Batch
        } else {
            JobKind::Document
        }
    }
}

/// Processing options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Run the VLM refinement stage after OCR
    pub vlm_refinement: bool,
    /// Only process the first N pages of each document
    pub max_pages: Option<u32>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            vlm_refinement: true,
            max_pages: None,
        }
    }
}

/// Job descriptor accepted by `Orchestrator::submit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// File, directory or archive to process
    pub source: PathBuf,
    #[serde(default)]
    pub options: ProcessingOptions,
    /// Overrides kind detection when set
    #[serde(default)]
    pub kind: Option<JobKind>,
}

impl JobDescriptor {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            options: ProcessingOptions::default(),
            kind: None,
        }
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind.unwrap_or_else(|| JobKind::detect(&self.source))
    }

    /// File name shown in task snapshots
    pub fn display_name(&self) -> String {
        self.source
            .file_name()
            .and_then(|s| s.to_str())
            .map(String::from)
            .unwrap_or_else(|| self.source.display().to_string())
    }
}
