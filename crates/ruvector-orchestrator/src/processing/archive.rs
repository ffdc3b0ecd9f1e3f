//! Batch containers: zip archives and directories
//!
//! Archives are extracted into a scratch directory that lives as long as the
//! returned [`BatchContents`]; dropping it removes the extracted files.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Entries that are never treated as documents
const SYSTEM_ENTRIES: &[&str] = &["__MACOSX", "Thumbs.db", "desktop.ini"];

/// Does this path name a supported archive?
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn is_hidden_or_system(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.')
        || SYSTEM_ENTRIES
            .iter()
            .any(|entry| name.eq_ignore_ascii_case(entry))
}

/// Documents found in one container, in a stable order
pub struct BatchContents {
    _scratch: Option<TempDir>,
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl BatchContents {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Name of an inner file relative to the container root
    pub fn display_name(&self, file: &Path) -> String {
        file.strip_prefix(&self.root)
            .unwrap_or(file)
            .to_string_lossy()
            .into_owned()
    }
}

/// Open a container for batch processing.
///
/// Directories are enumerated in place. Zip archives are extracted first,
/// into `work_dir` when given and the system temp dir otherwise.
pub fn open_batch(source: &Path, work_dir: Option<&Path>, max_files: usize) -> Result<BatchContents> {
    if source.is_dir() {
        let files = collect_files(source, max_files)?;
        return Ok(BatchContents {
            _scratch: None,
            root: source.to_path_buf(),
            files,
        });
    }

    if !is_archive(source) {
        return Err(Error::archive(format!(
            "{} is neither a directory nor a zip archive",
            source.display()
        )));
    }

    let mut archive = ZipArchive::new(File::open(source)?)?;
    let entries = archive.file_names().filter(|name| !name.ends_with('/')).count();
    if entries > max_files {
        return Err(Error::TooManyFiles {
            count: entries,
            max: max_files,
        });
    }

    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ruvector-batch-");
        builder
    };
    let scratch = match work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            builder.tempdir_in(dir)?
        }
        None => builder.tempdir()?,
    };

    archive.extract(scratch.path())?;
    tracing::debug!(
        "Extracted {} entries from {} into {}",
        archive.len(),
        source.display(),
        scratch.path().display()
    );

    let files = collect_files(scratch.path(), max_files)?;
    Ok(BatchContents {
        root: scratch.path().to_path_buf(),
        _scratch: Some(scratch),
        files,
    })
}

fn collect_files(root: &Path, max_files: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden_or_system(entry.file_name()));

    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    if files.len() > max_files {
        return Err(Error::TooManyFiles {
            count: files.len(),
            max: max_files,
        });
    }
    Ok(files)
}


#[cfg(test)]
mod tests {
    use super::fixtures::write_zip;
    use super::*;

    #[test]
    fn test_is_archive() {
        assert!(is_archive(Path::new("batch.zip")));
        assert!(is_archive(Path::new("BATCH.ZIP")));
        assert!(!is_archive(Path::new("report.txt")));
        assert!(!is_archive(Path::new("noext")));
    }

    #[test]
    fn test_directory_enumeration_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), "").unwrap();
        std::fs::write(dir.path().join("Thumbs.db"), "").unwrap();
        std::fs::create_dir(dir.path().join("__MACOSX")).unwrap();
        std::fs::write(dir.path().join("__MACOSX").join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.txt"), "c").unwrap();

        let batch = open_batch(dir.path(), None, 10).unwrap();
        let names: Vec<String> = batch.files().iter().map(|f| batch.display_name(f)).collect();

        let nested = Path::new("nested").join("c.txt").to_string_lossy().into_owned();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string(), nested]);
    }

    #[test]
    fn test_zip_is_extracted_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("batch.zip");
        write_zip(
            &archive,
            &[
                ("one.txt", "page one"),
                ("two.txt", "page two"),
                ("__MACOSX/._one.txt", ""),
            ],
        );

        let work = dir.path().join("work");
        let batch = open_batch(&archive, Some(&work), 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.root().starts_with(&work));
        assert_eq!(std::fs::read_to_string(&batch.files()[0]).unwrap(), "page one");

        let root = batch.root().to_path_buf();
        drop(batch);
        assert!(!root.exists());
    }

    #[test]
    fn test_file_limit() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("batch.zip");
        write_zip(&archive, &[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);

        let err = open_batch(&archive, None, 2).err().unwrap();
        assert!(matches!(err, Error::TooManyFiles { count: 3, max: 2 }));
    }

    #[test]
    fn test_invalid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, "not a zip").unwrap();
        assert!(matches!(open_batch(&archive, None, 10), Err(Error::Zip(_))));

        let plain = dir.path().join("plain.txt");
        std::fs::write(&plain, "text").unwrap();
        assert!(matches!(open_batch(&plain, None, 10), Err(Error::Archive(_))));
    }
}
