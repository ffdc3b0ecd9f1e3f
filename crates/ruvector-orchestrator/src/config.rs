//! Configuration for the orchestrator

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Retention of finished tasks
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Jobs allowed in their heavy stage at once (default: 3)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// How often a paused worker re-checks for cancellation (default: 250ms)
    #[serde(default = "default_checkpoint_poll_ms")]
    pub checkpoint_poll_ms: u64,
    /// Upper bound on files accepted from one container (default: 1000)
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,
    /// Where archives are extracted; system temp dir when unset
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_max_concurrent_jobs() -> usize { 3 }
fn default_checkpoint_poll_ms() -> u64 { 250 }
fn default_max_batch_files() -> usize { 1000 }

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            checkpoint_poll_ms: default_checkpoint_poll_ms(),
            max_batch_files: default_max_batch_files(),
            work_dir: None,
        }
    }
}

impl ProcessingConfig {
    pub fn checkpoint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_poll_ms)
    }
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Finished tasks kept by `cleanup_with_retention` (default: 100)
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_keep_recent() -> usize { 100 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_recent: default_keep_recent(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processing.max_concurrent_jobs == 0 {
            return Err(Error::config("processing.max_concurrent_jobs must be at least 1"));
        }
        if self.processing.checkpoint_poll_ms == 0 {
            return Err(Error::config("processing.checkpoint_poll_ms must be at least 1"));
        }
        if self.processing.max_batch_files == 0 {
            return Err(Error::config("processing.max_batch_files must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.processing.max_concurrent_jobs, 3);
        assert_eq!(config.processing.checkpoint_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.retention.keep_recent, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [processing]
            max_concurrent_jobs = 5
            work_dir = "/var/tmp/batches"

            [retention]
            keep_recent = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.processing.max_concurrent_jobs, 5);
        assert_eq!(config.processing.checkpoint_poll_ms, 250);
        assert_eq!(config.processing.work_dir, Some(PathBuf::from("/var/tmp/batches")));
        assert_eq!(config.retention.keep_recent, 10);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.processing.max_batch_files, 1000);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = OrchestratorConfig::from_toml_str("[processing]\nmax_concurrent_jobs = 0\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
