//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait: the handful of operations
//! the loader needs to pull bundles from a store and keep versioned copies
//! of them in another.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::{Hold, MockBackend};
use crate::error::Result;
use crate::models::Progress;
use async_trait::async_trait;
use std::path::Path;

/// Unified interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use haul_storage::{Progress, StorageBackend, error::Result};
///
/// async fn fetch_bundle(backend: &dyn StorageBackend) -> Result<Vec<u8>> {
///     let progress = Progress::default();
///     let bytes = backend.fetch(Path::new("Android/cube0"), &progress).await?;
///     assert!(progress.is_finished());
///     Ok(bytes)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read file contents while reporting progress.
    ///
    /// The default implementation reads everything in one go and marks the
    /// progress as finished afterwards. Backends that can stream should
    /// override this to report bytes as they arrive.
    async fn fetch(&self, path: &Path, progress: &Progress) -> Result<Vec<u8>> {
        let data = self.read(path).await?;
        progress.set_total(data.len() as u64);
        progress.advance(data.len() as u64);
        progress.finish();
        Ok(data)
    }

    /// Write file contents.
    ///
    /// Creates a new file or overwrites an existing file with the provided
    /// data. Implementations should create parent directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
}
