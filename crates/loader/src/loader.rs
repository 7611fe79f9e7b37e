use crate::error::{ErrorKind, Result};
use crate::extract::{Asset, ExtractorHandle};
use crate::orchestrator::Orchestrator;
use crate::request::{LoadRequest, Purpose, RequestInner, SharedRequest, lock};
use crate::transport::Transport;
use crate::{BundleKey, Manifest};
use exn::ResultExt;
use haul_config::Config;
use haul_storage::backend::LocalBackend;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Bundle carrying the manifest.
    pub manifest_key: BundleKey,
    /// Name of the manifest asset inside that bundle.
    pub manifest_asset: String,
}
impl Default for LoaderOptions {
    fn default() -> Self {
        Self { manifest_key: BundleKey::new("manifest"), manifest_asset: "manifest".to_string() }
    }
}

/// The caller-facing loader: starts loads, hands out [`LoadRequest`]s and
/// moves everything forward on [`tick`](Self::tick).
///
/// Every mutation goes through `&mut self`. Share it between tasks with a
/// [`SharedLoader`](crate::SharedLoader).
pub struct Loader {
    orchestrator: Orchestrator,
    extractor: ExtractorHandle,
    runtime: Handle,
    options: LoaderOptions,
    requests: Vec<SharedRequest>,
    shut_down: bool,
}

impl Loader {
    /// Must be called from within a tokio runtime; downloads and extractions
    /// are spawned onto it.
    pub fn new(transport: Transport, extractor: ExtractorHandle, options: LoaderOptions) -> Result<Self> {
        let runtime = Handle::try_current().or_raise(|| ErrorKind::Runtime)?;
        Ok(Self {
            orchestrator: Orchestrator::new(transport, runtime.clone(), options.manifest_key.clone()),
            extractor,
            runtime,
            options,
            requests: Vec::new(),
            shut_down: false,
        })
    }

    /// Build a loader reading bundles from the configured directory, keeping
    /// versioned copies in the cache directory when caching is enabled.
    pub fn from_config(config: &Config, extractor: ExtractorHandle) -> Result<Self> {
        let root = config.storage.root().or_raise(|| ErrorKind::Config)?;
        let remote = LocalBackend::new("bundles", &root).or_raise(|| ErrorKind::Storage)?;
        let mut transport = Transport::new(Arc::new(remote));
        if let Some(prefix) = &config.storage.prefix {
            transport = transport.with_prefix(prefix);
        }
        if let Some(dir) = config.cache.dir() {
            match LocalBackend::new("cache", &dir) {
                Ok(cache) => transport = transport.with_cache(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), reason = %e.reason(), "Bundle cache unavailable; continuing without it");
                },
            }
        }
        let options = LoaderOptions {
            manifest_key: BundleKey::new(config.manifest.key.as_str()),
            manifest_asset: config.manifest.asset.clone(),
        };
        Self::new(transport, extractor, options)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn install_manifest(&mut self, manifest: impl Into<Arc<Manifest>>) {
        self.orchestrator.install_manifest(manifest);
    }

    /// Fetch the manifest bundle and install the manifest inside it as soon
    /// as it is extracted.
    pub fn download_manifest(&mut self) -> Result<LoadRequest<Manifest>> {
        let key = self.options.manifest_key.clone();
        let asset = self.options.manifest_asset.clone();
        self.enqueue(key, asset, Manifest::KIND, Purpose::Manifest).map(LoadRequest::new)
    }

    /// Start loading `asset` of type `T` from the bundle `key`.
    ///
    /// This takes one reference on the bundle and its dependencies, released
    /// with [`unload`](Self::unload).
    pub fn request_load<T: Asset>(
        &mut self,
        key: impl Into<BundleKey>,
        asset: impl Into<String>,
    ) -> Result<LoadRequest<T>> {
        self.enqueue(key.into(), asset.into(), T::KIND, Purpose::Asset).map(LoadRequest::new)
    }

    #[instrument(skip(self, key), fields(key = %key))]
    fn enqueue(&mut self, key: BundleKey, asset: String, kind: &'static str, purpose: Purpose) -> Result<SharedRequest> {
        if self.shut_down {
            exn::bail!(ErrorKind::Shutdown);
        }
        self.orchestrator.request_download(&key)?;
        let request = Arc::new(Mutex::new(RequestInner::new(key, asset, kind, purpose, &self.orchestrator)));
        self.requests.push(request.clone());
        Ok(request)
    }

    pub fn unload(&mut self, key: &str) {
        self.orchestrator.unload(key);
    }

    /// One step of the loop: resolve finished downloads, then move every
    /// outstanding request forward by at most one state. Finished requests
    /// leave the poll set.
    pub fn tick(&mut self) {
        if self.shut_down {
            return;
        }
        self.orchestrator.advance();
        let Self { orchestrator, extractor, runtime, requests, .. } = self;
        requests.retain(|request| !lock(request).advance(orchestrator, extractor, runtime));
    }

    /// Requests still being moved forward by [`tick`](Self::tick).
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn cancel(&mut self, key: &str) -> bool {
        self.orchestrator.cancel(key)
    }

    pub fn clear_error(&mut self, key: &str) -> bool {
        self.orchestrator.clear_error(key)
    }

    /// Cancel all downloads, fail every outstanding request and release all
    /// cached bundles. The loader refuses new requests afterwards.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::info!(requests = self.requests.len(), "Shutting down loader");
        for request in self.requests.drain(..) {
            lock(&request).abort(ErrorKind::Shutdown);
        }
        self.orchestrator.shutdown();
        self.shut_down = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.orchestrator.ref_count(key)
    }

    pub fn error(&self, key: &str) -> Option<&str> {
        self.orchestrator.error(key)
    }

    pub fn dependencies(&self, key: &str) -> Option<&[BundleKey]> {
        self.orchestrator.dependencies(key)
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.orchestrator.is_cached(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.orchestrator.is_in_flight(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonExtractor, LoadState, LoadStatus};
    use haul_storage::backend::MockBackend;
    use serde_json::Value;

    fn loader(backend: MockBackend) -> Loader {
        Loader::new(Transport::new(Arc::new(backend)), Arc::new(JsonExtractor::new()), LoaderOptions::default())
            .unwrap()
    }

    #[test]
    fn test_new_requires_runtime() {
        let transport = Transport::new(Arc::new(MockBackend::default()));
        let err = Loader::new(transport, Arc::new(JsonExtractor::new()), LoaderOptions::default()).err().unwrap();
        assert_eq!(*err, ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_request_without_manifest() {
        let mut loader = loader(MockBackend::default());
        let err = loader.request_load::<Value>("cube0", "Cube").err().unwrap();
        assert_eq!(*err, ErrorKind::ManifestUninitialized);
        assert_eq!(loader.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_download_manifest_installs_it() {
        let backend = MockBackend::with_files([(
            "manifest",
            br#"{"assets": {"manifest": {"kind": "manifest", "data": {"bundles": {"cube0": {"version": "a1"}}}}}}"#,
        )]);
        let mut loader = loader(backend);
        let request = loader.download_manifest().unwrap();
        for _ in 0..200 {
            if request.state().is_terminal() {
                break;
            }
            loader.tick();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(request.state(), LoadState::Done);
        let manifest = loader.orchestrator().manifest().unwrap();
        assert!(manifest.contains("cube0"));
        assert!(matches!(request.poll(), LoadStatus::Ready(Some(_))));
        assert_eq!(loader.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_requests() {
        let backend = MockBackend::with_files([("cube0", b"{}")]);
        let _hold = backend.hold("cube0").await;
        let mut loader = loader(backend);
        loader.install_manifest(Manifest::default().with_bundle("cube0", "a1", [] as [&str; 0]));
        let request = loader.request_load::<Value>("cube0", "Cube").unwrap();
        loader.tick();
        loader.shutdown();
        assert!(matches!(request.poll(), LoadStatus::Failed(ErrorKind::Shutdown)));
        assert!(!loader.is_in_flight("cube0"));
        assert!(loader.is_shut_down());
        let err = loader.request_load::<Value>("cube0", "Cube").err().unwrap();
        assert_eq!(*err, ErrorKind::Shutdown);
    }
}
