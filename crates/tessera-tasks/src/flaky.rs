//! Durable quarantine list of flaky tasks

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::task::TaskId;

/// On-disk layout of the store
#[derive(Debug, Default, Serialize, Deserialize)]
struct FlakyFile {
    #[serde(default)]
    tests: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    path: Option<PathBuf>,
    tests: BTreeSet<TaskId>,
    dirty: bool,
}

/// Set of quarantined task ids persisted as JSON.
///
/// Clones share the same set. Every change that alters membership is written
/// through to disk immediately (temp file + rename); [`FlakyStore::flush`]
/// retries writes that failed earlier.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<Mutex<Inner>>,
}

impl FlakyStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlakyStoreError> {
        let path = path.into();
        let tests = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| FlakyStoreError::io(&path, e))?;
            if contents.trim().is_empty() {
                BTreeSet::new()
            } else {
                let file: FlakyFile = serde_json::from_str(&contents)?;
                file.tests.into_iter().collect()
            }
        } else {
            BTreeSet::new()
        };

        info!(path = %path.display(), count = tests.len(), "opened flaky store");
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                path: Some(path),
                tests,
                dirty: false,
            })),
        })
    }

    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                path: None,
                tests: BTreeSet::new(),
                dirty: false,
            })),
        }
    }

    /// Default store location under a run root
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(tessera_core::config::DEFAULT_FLAKY_FILE)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().tests.contains(id)
    }

    /// Quarantined ids, sorted
    pub fn list(&self) -> Vec<TaskId> {
        self.lock().tests.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tests.is_empty()
    }

    /// Quarantine a task. Returns whether it was newly added.
    pub fn add(&self, id: &TaskId) -> Result<bool, FlakyStoreError> {
        let mut inner = self.lock();
        if !inner.tests.insert(id.clone()) {
            return Ok(false);
        }
        inner.dirty = true;
        info!(task = %id, "added to flaky store");
        persist(&mut inner)?;
        Ok(true)
    }

    /// Quarantine a task in memory. The change reaches disk on the next
    /// [`FlakyStore::flush`], so callers on an async runtime can do the
    /// write from a blocking thread.
    pub fn mark(&self, id: &TaskId) -> bool {
        let mut inner = self.lock();
        if !inner.tests.insert(id.clone()) {
            return false;
        }
        inner.dirty = true;
        info!(task = %id, "marked flaky");
        true
    }

    /// Release a task from quarantine. Returns whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool, FlakyStoreError> {
        let mut inner = self.lock();
        if !inner.tests.remove(id) {
            return Ok(false);
        }
        inner.dirty = true;
        info!(task = id, "removed from flaky store");
        persist(&mut inner)?;
        Ok(true)
    }

    /// Empty the store, returning how many ids were removed
    pub fn clear(&self) -> Result<usize, FlakyStoreError> {
        let mut inner = self.lock();
        let removed = inner.tests.len();
        inner.tests.clear();
        inner.dirty = true;
        persist(&mut inner)?;
        Ok(removed)
    }

    /// Write pending changes, if any
    pub fn flush(&self) -> Result<(), FlakyStoreError> {
        let mut inner = self.lock();
        if inner.dirty {
            persist(&mut inner)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn persist(inner: &mut Inner) -> Result<(), FlakyStoreError> {
    let Some(path) = inner.path.clone() else {
        inner.dirty = false;
        return Ok(());
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| FlakyStoreError::io(parent, e))?;
    }

    let file = FlakyFile {
        tests: inner.tests.iter().cloned().collect(),
        updated_at: Some(Utc::now()),
    };
    let json = serde_json::to_string_pretty(&file)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(|e| FlakyStoreError::io(&tmp_path, e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.sync_all())
            .map_err(|e| FlakyStoreError::io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, &path).map_err(|e| FlakyStoreError::io(&path, e))?;

    inner.dirty = false;
    debug!(path = %path.display(), count = inner.tests.len(), "flaky store written");
    Ok(())
}

/// Flaky store errors
#[derive(Debug, thiserror::Error)]
pub enum FlakyStoreError {
    #[error("Flaky store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Flaky store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlakyStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = FlakyStore::open(temp.path().join("flaky-list.json")).unwrap();
        assert!(store.is_empty());
        assert!(!temp.path().join("flaky-list.json").exists());
    }

    #[test]
    fn test_add_persists_and_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flaky-list.json");
        let store = FlakyStore::open(&path).unwrap();

        assert!(store.add(&TaskId::new("blog-e2e")).unwrap());
        assert!(!store.add(&TaskId::new("blog-e2e")).unwrap());
        assert!(store.contains("blog-e2e"));
        assert_eq!(store.len(), 1);

        let reopened = FlakyStore::open(&path).unwrap();
        assert_eq!(reopened.list(), vec![TaskId::new("blog-e2e")]);
    }

    #[test]
    fn test_mark_waits_for_flush() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flaky-list.json");
        let store = FlakyStore::open(&path).unwrap();

        assert!(store.mark(&TaskId::new("blog-e2e")));
        assert!(!store.mark(&TaskId::new("blog-e2e")));
        assert!(store.contains("blog-e2e"));
        assert!(!path.exists());

        store.flush().unwrap();
        let reopened = FlakyStore::open(&path).unwrap();
        assert_eq!(reopened.list(), vec![TaskId::new("blog-e2e")]);
    }

    #[test]
    fn test_file_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flaky-list.json");
        let store = FlakyStore::open(&path).unwrap();
        store.add(&TaskId::new("server-unit")).unwrap();
        store.add(&TaskId::new("blog-e2e")).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["tests"], serde_json::json!(["blog-e2e", "server-unit"]));
        assert!(value["updated_at"].is_string());
        assert!(!temp.path().join("flaky-list.json.tmp").exists());
    }

    #[test]
    fn test_reads_file_without_timestamp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flaky-list.json");
        fs::write(&path, r#"{"tests": ["blog-integration"]}"#).unwrap();

        let store = FlakyStore::open(&path).unwrap();
        assert!(store.contains("blog-integration"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flaky-list.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FlakyStore::open(&path),
            Err(FlakyStoreError::Json(_))
        ));
    }

    #[test]
    fn test_remove_and_clear() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("flaky-list.json");
        let store = FlakyStore::open(&path).unwrap();
        store.add(&TaskId::new("a")).unwrap();
        store.add(&TaskId::new("b")).unwrap();
        store.add(&TaskId::new("c")).unwrap();

        assert!(store.remove("b").unwrap());
        assert!(!store.remove("b").unwrap());
        assert_eq!(FlakyStore::open(&path).unwrap().len(), 2);

        assert_eq!(store.clear().unwrap(), 2);
        assert!(FlakyStore::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let store = FlakyStore::in_memory();
        let clone = store.clone();
        clone.add(&TaskId::new("blog-unit")).unwrap();
        assert!(store.contains("blog-unit"));
        assert!(store.path().is_none());
        store.flush().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_write_failure_is_retried_on_flush() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("store");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flaky-list.json");
        let store = FlakyStore::open(&path).unwrap();

        fs::set_permissions(&dir, fs::Permissions::from_mode(0o500)).unwrap();
        let result = store.add(&TaskId::new("blog-e2e"));
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();

        // root ignores directory permissions, so only check the failure path when it applies
        if result.is_err() {
            assert!(store.contains("blog-e2e"));
            store.flush().unwrap();
        }
        assert!(FlakyStore::open(&path).unwrap().contains("blog-e2e"));
    }
}
