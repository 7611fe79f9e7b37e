use crate::{BundleKey, ContentVersion};
use haul_storage::error::Result as StorageResult;
use haul_storage::{BackendHandle, Progress, validate_path};
use std::path::PathBuf;
use tracing::instrument;

/// Where bundle bytes come from.
///
/// Versioned fetches are served from the local cache backend when a copy of
/// that exact version exists there, and written into it after a successful
/// remote read. Unversioned fetches (the manifest bundle, or keys the
/// manifest doesn't know) always go to the remote.
///
/// Cached copies live at `<key>/<blake3(version)>`, so a new version of a
/// bundle never collides with an old one.
#[derive(Clone)]
pub struct Transport {
    remote: BackendHandle,
    cache: Option<BackendHandle>,
    prefix: Option<PathBuf>,
}

impl Transport {
    pub fn new(remote: BackendHandle) -> Self {
        Self { remote, cache: None, prefix: None }
    }

    pub fn with_cache(mut self, cache: BackendHandle) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Prefix for remote paths, typically the platform folder bundles were
    /// built into.
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn remote_path(&self, key: &BundleKey) -> StorageResult<PathBuf> {
        let relative = match &self.prefix {
            Some(prefix) => prefix.join(key.as_str()),
            None => PathBuf::from(key.as_str()),
        };
        validate_path(&relative)
    }

    pub fn cache_path(key: &BundleKey, version: &ContentVersion) -> StorageResult<PathBuf> {
        Ok(validate_path(key.as_str())?.join(version.digest()))
    }

    #[instrument(skip(self, version, progress), fields(remote = self.remote.name(), version = version.map(|v| v.as_str())))]
    pub async fn fetch(
        &self,
        key: &BundleKey,
        version: Option<&ContentVersion>,
        progress: &Progress,
    ) -> StorageResult<Vec<u8>> {
        let remote_path = self.remote_path(key)?;
        let (Some(version), Some(cache)) = (version, &self.cache) else {
            return self.remote.fetch(&remote_path, progress).await;
        };

        let cache_path = Self::cache_path(key, version)?;
        match cache.exists(&cache_path).await {
            Ok(true) => match cache.fetch(&cache_path, progress).await {
                Ok(data) => {
                    tracing::debug!(cache = cache.name(), "Served bundle from local cache");
                    return Ok(data);
                },
                Err(e) => tracing::warn!(reason = %e.reason(), "Cached copy unreadable; downloading again"),
            },
            Ok(false) => (),
            Err(e) => tracing::warn!(reason = %e.reason(), "Could not check local cache"),
        }

        let data = self.remote.fetch(&remote_path, progress).await?;
        // Failing to keep a copy only costs a download next time.
        if let Err(e) = cache.write(&cache_path, &data).await {
            tracing::warn!(reason = %e.reason(), "Could not store bundle in local cache");
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_storage::StorageBackend;
    use haul_storage::backend::{LocalBackend, MockBackend};
    use haul_storage::error::ErrorKind as StorageErrorKind;
    use std::path::Path;
    use std::sync::Arc;

    fn key(key: &str) -> BundleKey {
        BundleKey::new(key)
    }

    #[tokio::test]
    async fn test_unversioned_reads_remote() {
        let remote = Arc::new(MockBackend::with_files([("manifest", b"m")]));
        let cache = Arc::new(MockBackend::default());
        let transport = Transport::new(remote.clone()).with_cache(cache.clone());
        let data = transport.fetch(&key("manifest"), None, &Progress::default()).await.unwrap();
        assert_eq!(data, b"m");
        assert!(!cache.exists(Path::new("manifest")).await.unwrap());
    }

    #[tokio::test]
    async fn test_versioned_fills_then_serves_cache() {
        let remote = Arc::new(MockBackend::with_files([("cube0", b"bytes")]));
        let cache = Arc::new(MockBackend::default());
        let transport = Transport::new(remote.clone()).with_cache(cache.clone());
        let version = ContentVersion::new("v1");

        let first = transport.fetch(&key("cube0"), Some(&version), &Progress::default()).await.unwrap();
        let second = transport.fetch(&key("cube0"), Some(&version), &Progress::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.reads("cube0").await, 1);
        let cached = Transport::cache_path(&key("cube0"), &version).unwrap();
        assert_eq!(cache.read(&cached).await.unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn test_new_version_bypasses_old_copy() {
        let remote = Arc::new(MockBackend::with_files([("cube0", b"bytes")]));
        let transport = Transport::new(remote.clone()).with_cache(Arc::new(MockBackend::default()));
        for version in ["v1", "v2"] {
            let version = ContentVersion::new(version);
            transport.fetch(&key("cube0"), Some(&version), &Progress::default()).await.unwrap();
        }
        assert_eq!(remote.reads("cube0").await, 2);
    }

    #[tokio::test]
    async fn test_prefix() {
        let remote = Arc::new(MockBackend::with_files([("Android/cube0", b"android")]));
        let transport = Transport::new(remote).with_prefix("Android");
        let data = transport.fetch(&key("cube0"), None, &Progress::default()).await.unwrap();
        assert_eq!(data, b"android");
    }

    #[tokio::test]
    async fn test_remote_failure_propagates() {
        let remote = Arc::new(MockBackend::with_files([("cube2", b"x")]).with_failure("cube2", "404"));
        let transport = Transport::new(remote).with_cache(Arc::new(MockBackend::default()));
        let err = transport
            .fetch(&key("cube2"), Some(&ContentVersion::new("v1")), &Progress::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "404");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let transport = Transport::new(Arc::new(MockBackend::default()));
        let err = transport.fetch(&key("../secrets"), None, &Progress::default()).await.unwrap_err();
        assert!(matches!(&*err, StorageErrorKind::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_local_cache_on_disk() {
        let remote_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        std::fs::write(remote_dir.path().join("cube0"), b"from disk").unwrap();
        let transport = Transport::new(Arc::new(LocalBackend::new("bundles", remote_dir.path()).unwrap()))
            .with_cache(Arc::new(LocalBackend::new("cache", cache_dir.path()).unwrap()));
        let version = ContentVersion::new("v1");
        let progress = Progress::default();
        transport.fetch(&key("cube0"), Some(&version), &progress).await.unwrap();
        assert!(progress.is_finished());
        let cached = cache_dir.path().join(Transport::cache_path(&key("cube0"), &version).unwrap());
        assert_eq!(std::fs::read(cached).unwrap(), b"from disk");
    }
}
