use crate::config::slugify;
use crate::services::store::is_image_path;
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Supplies candidate image locators (URLs or file paths) for an alias.
///
/// Each call continues after the locators returned by the previous call
/// for the same alias; an empty result means the source is exhausted.
pub trait UrlSource: Send + Sync {
    fn search(&self, alias: &str, desired_count: usize) -> Result<Vec<String>, SourceError>;
}

/// Per-alias read position shared by the list-backed sources.
#[derive(Default)]
struct Cursors(Mutex<HashMap<String, usize>>);

impl Cursors {
    fn take(&self, alias: &str, all: Vec<String>, desired_count: usize) -> Vec<String> {
        let mut cursors = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let start = cursors.entry(alias.to_string()).or_insert(0);
        let batch: Vec<String> = all.into_iter().skip(*start).take(desired_count).collect();
        *start += batch.len();
        batch
    }
}

/// Reads `<dir>/<alias_slug>.txt`, one URL per line.
///
/// Blank lines and lines starting with `#` are ignored. A missing file
/// yields no URLs.
pub struct UrlListSource {
    dir: PathBuf,
    cursors: Cursors,
}

impl UrlListSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cursors: Cursors::default(),
        }
    }

    fn list_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", slugify(alias)))
    }
}

impl UrlSource for UrlListSource {
    fn search(&self, alias: &str, desired_count: usize) -> Result<Vec<String>, SourceError> {
        let path = self.list_path(alias);
        if !path.exists() {
            debug!("No URL list at {}", path.display());
            return Ok(Vec::new());
        }
        let urls = fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(self.cursors.take(alias, urls, desired_count))
    }
}

/// Lists image files under `<root>/<alias_slug>/`, in path order.
pub struct DirectorySource {
    root: PathBuf,
    cursors: Cursors,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cursors: Cursors::default(),
        }
    }

    /// Sub-directory names of `root`, sorted; each names one subject.
    pub fn subject_dirs(root: &Path) -> Result<Vec<String>, SourceError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl UrlSource for DirectorySource {
    fn search(&self, alias: &str, desired_count: usize) -> Result<Vec<String>, SourceError> {
        let dir = self.root.join(slugify(alias));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() && is_image_path(entry.path()) {
                files.push(entry.path().to_string_lossy().into_owned());
            }
        }
        Ok(self.cursors.take(alias, files, desired_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_url_list_pages_through_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("Jane_Doe.txt"),
            "# scraped\nhttps://a/1.jpg\n\nhttps://a/2.jpg\n  https://a/3.jpg  \n",
        )
        .unwrap();

        let source = UrlListSource::new(temp_dir.path());
        assert_eq!(
            source.search("Jane Doe", 2).unwrap(),
            vec!["https://a/1.jpg", "https://a/2.jpg"]
        );
        assert_eq!(source.search("Jane Doe", 2).unwrap(), vec!["https://a/3.jpg"]);
        assert!(source.search("Jane Doe", 2).unwrap().is_empty());
    }

    #[test]
    fn test_url_list_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let source = UrlListSource::new(temp_dir.path());
        assert!(source.search("Nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn test_directory_source_lists_images_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("Jane_Doe");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("b.jpg"), b"x").unwrap();
        fs::write(dir.join("a.PNG"), b"x").unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        fs::write(dir.join("nested").join("c.webp"), b"x").unwrap();

        let source = DirectorySource::new(temp_dir.path());
        let found: Vec<String> = source
            .search("Jane Doe", 10)
            .unwrap()
            .into_iter()
            .map(|p| Path::new(&p).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found, vec!["a.PNG", "b.jpg", "c.webp"]);
        assert!(source.search("Jane Doe", 10).unwrap().is_empty());
    }

    #[test]
    fn test_subject_dirs() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("zed")).unwrap();
        fs::create_dir(temp_dir.path().join("amy")).unwrap();
        fs::write(temp_dir.path().join("file.txt"), b"x").unwrap();
        assert_eq!(
            DirectorySource::subject_dirs(temp_dir.path()).unwrap(),
            vec!["amy", "zed"]
        );
    }
}
