//! In-memory storage backend for testing.

use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, watch};

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. On top of plain
/// storage it can simulate a misbehaving remote:
///
/// - [`with_failure`](Self::with_failure) makes reads of a path fail with a
///   [`Network`](ErrorKind::Network) error carrying the given reason,
/// - [`hold`](Self::hold) parks reads of a path until the returned [`Hold`]
///   is released (or dropped), which keeps a download "in flight",
/// - [`reads`](Self::reads) counts how often a path was read.
///
/// # Examples
///
/// ```
/// use haul_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("cube0", b"{}")]).with_failure("cube2", "404");
/// assert_eq!(backend.read(Path::new("cube0")).await?, b"{}");
/// assert!(backend.read(Path::new("cube2")).await.is_err());
/// assert_eq!(backend.reads("cube0").await, 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Vec<u8>>>,
    failures: RwLock<HashMap<PathBuf, String>>,
    holds: RwLock<HashMap<PathBuf, watch::Receiver<bool>>>,
    reads: RwLock<HashMap<PathBuf, usize>>,
}

/// Keeps reads of one path parked until released.
///
/// Dropping a `Hold` releases it too, so a test that forgets about it can't
/// deadlock the download forever.
pub struct Hold {
    release: watch::Sender<bool>,
}
impl Hold {
    pub fn release(self) {
        _ = self.release.send(true);
    }
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation. If test setup is wrong, then test
    /// should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        for (path, data) in files {
            map.insert(Self::validated(path), data.into());
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            failures: RwLock::default(),
            holds: RwLock::default(),
            reads: RwLock::default(),
        }
    }

    /// Make every read of `path` fail with a network error carrying `reason`.
    pub fn with_failure(mut self, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        self.failures.get_mut().insert(Self::validated(path), reason.into());
        self
    }

    /// Park reads of `path` until the returned [`Hold`] is released.
    pub async fn hold(&self, path: impl Into<PathBuf>) -> Hold {
        let (release, parked) = watch::channel(false);
        self.holds.write().await.insert(Self::validated(path), parked);
        Hold { release }
    }

    /// Number of times `path` has been read.
    pub async fn reads(&self, path: impl Into<PathBuf>) -> usize {
        self.reads.read().await.get(&Self::validated(path)).copied().unwrap_or(0)
    }

    fn validated(path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        let Ok(validated) = validate_path(&path) else {
            // The panic here is DELIBERATE. MockBackend is intended to be
            // used in tests; panics are expected.
            panic!("MockBackend: invalid path {}", path.display());
        };
        validated
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &[u8]); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        *self.reads.write().await.entry(path.clone()).or_default() += 1;
        // Clone the receiver and drop the lock before parking, otherwise
        // `hold()` for another path would wait on us.
        let parked = self.holds.read().await.get(&path).cloned();
        if let Some(mut parked) = parked {
            // An error means the Hold was dropped, which also releases.
            _ = parked.wait_for(|released| *released).await;
        }
        if let Some(reason) = self.failures.read().await.get(&path) {
            exn::bail!(ErrorKind::Network(reason.clone()));
        }
        let data = self.storage.read().await.get(&path).cloned();
        data.ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.insert(path, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Progress;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_and_read() {
        let backend = MockBackend::default();
        backend.write(Path::new("cube0"), b"hello").await.unwrap();
        assert_eq!(backend.read(Path::new("cube0")).await.unwrap(), b"hello");
        assert!(backend.exists(Path::new("cube0")).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_carries_reason() {
        let backend = MockBackend::with_files([("cube2", b"data")]).with_failure("cube2", "404");
        let err = backend.read(Path::new("cube2")).await.unwrap_err();
        assert_eq!(err.reason(), "404");
    }

    #[tokio::test]
    async fn test_reads_are_counted() {
        let backend = MockBackend::with_files([("shared", b"data")]);
        assert_eq!(backend.reads("shared").await, 0);
        backend.read(Path::new("shared")).await.unwrap();
        backend.read(Path::new("shared")).await.unwrap();
        assert_eq!(backend.reads("shared").await, 2);
    }

    #[tokio::test]
    async fn test_hold_parks_fetch_until_released() {
        let backend = Arc::new(MockBackend::with_files([("cube0", b"data")]));
        let hold = backend.hold("cube0").await;
        let progress = Progress::default();
        let task = tokio::spawn({
            let backend = backend.clone();
            let progress = progress.clone();
            async move { backend.fetch(Path::new("cube0"), &progress).await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        assert_eq!(progress.ratio(), 0.0);
        hold.release();
        assert_eq!(task.await.unwrap().unwrap(), b"data");
        assert!(progress.is_finished());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../escape"), b"bad").await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
