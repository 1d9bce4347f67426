//! Storage module - durable record storage for event logs
//!
//! Event streams persist one addressable record per event plus one record per
//! archived page. The [`FileStore`] trait abstracts the backing medium so the
//! same stream code runs against the local filesystem in production and an
//! in-memory map in tests.

pub mod locations;

use crate::error::{LoomError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Addressable record storage.
///
/// Paths are `/`-separated logical keys, not OS paths; implementations map
/// them onto their medium. All operations are synchronous because they run
/// inside the event stream's write critical section.
pub trait FileStore: Send + Sync {
    /// Write `contents` at `path`, creating parents as needed.
    fn write(&self, path: &str, contents: &str) -> Result<()>;

    /// Read the record at `path`. Returns [`LoomError::NotFound`] when absent.
    fn read(&self, path: &str) -> Result<String>;

    /// List the names of the immediate children of `path`.
    ///
    /// Returns an empty list for a missing directory; callers that need to
    /// distinguish "no such session" from "empty" should check a parent.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Delete the record at `path`. Deleting a missing record is a no-op.
    fn delete(&self, path: &str) -> Result<()>;

    /// Whether any record exists at or under `path`.
    fn exists(&self, path: &str) -> bool;
}

/// Filesystem-backed [`FileStore`] rooted at a directory.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileStore for LocalFileStore {
    fn write(&self, path: &str, contents: &str) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, contents)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String> {
        let full = self.full_path(path);
        match std::fs::read_to_string(&full) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LoomError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.full_path(path);
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.full_path(path).exists()
    }
}

/// In-memory [`FileStore`] for tests and broker-substitute deployments.
///
/// # Example
/// ```
/// use eventloom::storage::{FileStore, InMemoryFileStore};
///
/// let store = InMemoryFileStore::new();
/// store.write("sessions/s1/events/0.json", "{}").unwrap();
/// assert!(store.exists("sessions/s1/events"));
/// assert_eq!(store.list("sessions/s1/events").unwrap(), vec!["0.json"]);
/// ```
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<String, String>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl FileStore for InMemoryFileStore {
    fn write(&self, path: &str, contents: &str) -> Result<()> {
        let mut files = self.files.lock().expect("file store lock poisoned");
        files.insert(Self::normalize(path), contents.to_string());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String> {
        let files = self.files.lock().expect("file store lock poisoned");
        files
            .get(&Self::normalize(path))
            .cloned()
            .ok_or_else(|| LoomError::NotFound(path.to_string()))
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", Self::normalize(path));
        let files = self.files.lock().expect("file store lock poisoned");
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => rest.to_string(),
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut files = self.files.lock().expect("file store lock poisoned");
        files.remove(&Self::normalize(path));
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let normalized = Self::normalize(path);
        let prefix = format!("{}/", normalized);
        let files = self.files.lock().expect("file store lock poisoned");
        files
            .keys()
            .any(|key| key == &normalized || key.starts_with(&prefix))
    }
}
