//! Download orchestration: deduplication, dependency expansion, the bundle
//! cache with its reference counts, and the per-key error table.
//!
//! The orchestrator never waits on anything. Downloads run on their own tasks
//! and are only looked at from [`advance`](Orchestrator::advance), which is
//! the one place a finished download changes shared state.

use crate::error::{ErrorKind, Result};
use crate::fetch::Download;
use crate::transport::Transport;
use crate::{Bundle, BundleKey, Manifest};
use haul_storage::Progress;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Cached, in flight, or failed: no new fetch was issued.
    AlreadyKnown,
    /// A fetch was issued for the key.
    Started,
}

/// Whether a bundle and everything it depends on can be used.
#[derive(Debug, Clone)]
pub enum Readiness {
    Pending,
    Ready(Arc<Bundle>),
    /// `key` is the bundle that failed, which is either the one asked about
    /// or one of its dependencies. When a dependency failed, `bundle` still
    /// carries the requested bundle if it downloaded fine.
    Failed { key: BundleKey, error: String, bundle: Option<Arc<Bundle>> },
}
impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

struct CachedBundle {
    bundle: Arc<Bundle>,
    ref_count: usize,
}

enum Closure {
    Complete,
    Incomplete,
    Broken(BundleKey, String),
}

/// Owner of every download, cached bundle, error and dependency record.
///
/// A key is in at most one of: in flight, cached, failed.
pub struct Orchestrator {
    transport: Transport,
    runtime: Handle,
    manifest_key: BundleKey,
    manifest: Option<Arc<Manifest>>,
    in_flight: HashMap<BundleKey, Download>,
    cache: HashMap<BundleKey, CachedBundle>,
    errors: HashMap<BundleKey, String>,
    dependencies: HashMap<BundleKey, Vec<BundleKey>>,
    deferred_unloads: HashMap<BundleKey, usize>,
}

impl Orchestrator {
    /// `runtime` is where download tasks are spawned. `manifest_key` names
    /// the bundle carrying the manifest: the only bundle that may be fetched
    /// before a manifest is installed, and always fetched unversioned.
    pub fn new(transport: Transport, runtime: Handle, manifest_key: impl Into<BundleKey>) -> Self {
        Self {
            transport,
            runtime,
            manifest_key: manifest_key.into(),
            manifest: None,
            in_flight: HashMap::new(),
            cache: HashMap::new(),
            errors: HashMap::new(),
            dependencies: HashMap::new(),
            deferred_unloads: HashMap::new(),
        }
    }

    pub fn manifest_key(&self) -> &BundleKey {
        &self.manifest_key
    }

    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        self.manifest.as_ref()
    }

    /// Install the manifest, replacing any previous one.
    pub fn install_manifest(&mut self, manifest: impl Into<Arc<Manifest>>) {
        let manifest = manifest.into();
        if self.manifest.is_some() {
            tracing::debug!("Replacing installed manifest");
        }
        tracing::info!(bundles = manifest.len(), "Manifest installed");
        self.manifest = Some(manifest);
    }

    /// Ask for `key` to be downloaded, or take another reference to it.
    ///
    /// Each call is one reference to balance with an [`unload`](Self::unload),
    /// whether it started a fetch, joined one in flight, or hit the cache.
    /// Calls for a failed key are ignored until the error is
    /// [cleared](Self::clear_error).
    ///
    /// # Errors
    ///
    /// [`ManifestUninitialized`](ErrorKind::ManifestUninitialized) when `key`
    /// isn't the manifest bundle and no manifest is installed. Nothing
    /// changes in that case.
    #[instrument(skip(self, key), fields(key = %key))]
    pub fn request_download(&mut self, key: &BundleKey) -> Result<DownloadStatus> {
        if let Some(cached) = self.cache.get_mut(key) {
            cached.ref_count += 1;
            tracing::debug!(refs = cached.ref_count, "Bundle already cached");
            return Ok(DownloadStatus::AlreadyKnown);
        }
        if let Some(download) = self.in_flight.get_mut(key) {
            download.requests += 1;
            tracing::debug!(requests = download.requests, "Bundle already downloading");
            return Ok(DownloadStatus::AlreadyKnown);
        }
        if self.errors.contains_key(key) {
            tracing::debug!("Bundle previously failed; not fetching again");
            return Ok(DownloadStatus::AlreadyKnown);
        }

        let is_manifest = *key == self.manifest_key;
        let version = if is_manifest {
            None
        } else {
            let manifest = self.require_manifest()?;
            match manifest.version_of(key.as_str()) {
                Some(version) => Some(version.clone()),
                None => {
                    tracing::warn!("Bundle is not listed in the manifest; fetching unversioned");
                    None
                },
            }
        };
        let download = Download::spawn(&self.runtime, self.transport.clone(), key.clone(), version);
        self.in_flight.insert(key.clone(), download);
        tracing::debug!("Download started");

        if !is_manifest {
            self.resolve(key)?;
        }
        Ok(DownloadStatus::Started)
    }

    /// Request every direct dependency of `key`, once per key lifetime.
    fn resolve(&mut self, key: &BundleKey) -> Result<()> {
        let manifest = self.require_manifest()?;
        let dependencies = manifest.dependencies_of(key.as_str());
        if dependencies.is_empty() || self.dependencies.contains_key(key) {
            return Ok(());
        }
        self.dependencies.insert(key.clone(), dependencies.to_vec());
        tracing::debug!(key = %key, count = dependencies.len(), "Requesting dependencies");
        for dependency in dependencies {
            self.request_download(dependency)?;
        }
        Ok(())
    }

    fn require_manifest(&self) -> Result<Arc<Manifest>> {
        match &self.manifest {
            Some(manifest) => Ok(manifest.clone()),
            None => {
                tracing::error!("Bundle requested before a manifest was installed");
                exn::bail!(ErrorKind::ManifestUninitialized)
            },
        }
    }

    /// Readiness of `key` and its whole dependency closure. Never changes
    /// anything.
    pub fn get_ready(&self, key: &str) -> Readiness {
        if let Some(error) = self.errors.get(key) {
            return Readiness::Failed { key: BundleKey::new(key), error: error.clone(), bundle: None };
        }
        let Some(cached) = self.cache.get(key) else {
            return Readiness::Pending;
        };
        let mut visited = HashSet::from([key]);
        match self.closure(key, &mut visited) {
            Closure::Complete => Readiness::Ready(cached.bundle.clone()),
            Closure::Incomplete => Readiness::Pending,
            Closure::Broken(key, error) => Readiness::Failed { key, error, bundle: Some(cached.bundle.clone()) },
        }
    }

    fn closure<'a>(&'a self, key: &str, visited: &mut HashSet<&'a str>) -> Closure {
        let mut complete = true;
        for dependency in self.dependencies.get(key).into_iter().flatten() {
            if !visited.insert(dependency.as_str()) {
                continue;
            }
            if let Some(error) = self.errors.get(dependency) {
                return Closure::Broken(dependency.clone(), error.clone());
            }
            complete &= self.cache.contains_key(dependency);
            match self.closure(dependency.as_str(), visited) {
                Closure::Complete => (),
                Closure::Incomplete => complete = false,
                broken @ Closure::Broken(..) => return broken,
            }
        }
        if complete { Closure::Complete } else { Closure::Incomplete }
    }

    /// Drop one reference to `key`, evicting it at zero, and release the
    /// dependencies recorded for it.
    ///
    /// Unloading a key that is still downloading takes effect once the
    /// download resolves.
    #[instrument(skip(self))]
    pub fn unload(&mut self, key: &str) {
        if let Some((key, _)) = self.in_flight.get_key_value(key) {
            let deferred = self.deferred_unloads.entry(key.clone()).or_default();
            *deferred += 1;
            tracing::debug!(deferred = *deferred, "Bundle still downloading; unload deferred");
            return;
        }

        let mut known = false;
        if let Some(cached) = self.cache.get_mut(key) {
            known = true;
            cached.ref_count = cached.ref_count.saturating_sub(1);
            if cached.ref_count == 0 {
                self.cache.remove(key);
                tracing::info!("Bundle evicted");
            } else {
                tracing::debug!(refs = cached.ref_count, "Bundle reference released");
            }
        }
        // Removed before recursing so dependency cycles terminate.
        if let Some(dependencies) = self.dependencies.remove(key) {
            known = true;
            for dependency in &dependencies {
                self.unload(dependency.as_str());
            }
        }
        if !known {
            tracing::debug!("Nothing to unload");
        }
    }

    /// Move finished downloads into the cache or the error table, then apply
    /// unloads that were waiting on them. Returns how many downloads resolved.
    pub fn advance(&mut self) -> usize {
        let mut resolved = Vec::new();
        for (key, download) in &mut self.in_flight {
            if let Some(outcome) = download.try_finish() {
                resolved.push((key.clone(), outcome));
            }
        }
        let count = resolved.len();
        for (key, outcome) in resolved {
            let Some(download) = self.in_flight.remove(&key) else {
                continue;
            };
            match outcome {
                Ok(data) => {
                    tracing::info!(key = %key, bytes = data.len(), refs = download.requests, "Bundle downloaded");
                    let bundle = Arc::new(Bundle { key: key.clone(), version: download.version.clone(), data });
                    self.cache.insert(key, CachedBundle { bundle, ref_count: download.requests });
                },
                Err(reason) => {
                    tracing::warn!(key = %key, reason = %reason, "Bundle download failed");
                    self.errors.insert(key, reason);
                },
            }
        }

        let settled: Vec<BundleKey> =
            self.deferred_unloads.keys().filter(|key| !self.in_flight.contains_key(*key)).cloned().collect();
        for key in settled {
            let times = self.deferred_unloads.remove(&key).unwrap_or_default();
            for _ in 0..times {
                self.unload(key.as_str());
            }
        }
        count
    }

    /// Fire the cancellation token of an in-flight download. It resolves as
    /// a failure on a later [`advance`](Self::advance).
    #[instrument(skip(self))]
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.in_flight.get(key) {
            Some(download) => {
                download.cancel();
                tracing::info!("Download cancelled");
                true
            },
            None => false,
        }
    }

    /// Forget a recorded failure so the key can be requested again.
    pub fn clear_error(&mut self, key: &str) -> bool {
        self.errors.remove(key).is_some()
    }

    /// Cancel every download and release all cached content.
    pub fn shutdown(&mut self) {
        for download in self.in_flight.values() {
            download.cancel();
        }
        tracing::info!(
            in_flight = self.in_flight.len(),
            cached = self.cache.len(),
            "Shutting down bundle orchestrator"
        );
        self.in_flight.clear();
        self.cache.clear();
        self.errors.clear();
        self.dependencies.clear();
        self.deferred_unloads.clear();
    }

    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.cache.get(key).map(|cached| cached.ref_count)
    }

    pub fn error(&self, key: &str) -> Option<&str> {
        self.errors.get(key).map(String::as_str)
    }

    pub fn dependencies(&self, key: &str) -> Option<&[BundleKey]> {
        self.dependencies.get(key).map(Vec::as_slice)
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn bundle(&self, key: &str) -> Option<Arc<Bundle>> {
        self.cache.get(key).map(|cached| cached.bundle.clone())
    }

    /// Progress and cancellation token of every download `key` is still
    /// waiting on: its own if in flight, then those of its dependency closure.
    pub fn outstanding(&self, key: &str) -> Vec<(Progress, CancellationToken)> {
        let mut visited = HashSet::from([key]);
        let mut queue = vec![key];
        let mut outstanding = Vec::new();
        while let Some(key) = queue.pop() {
            if let Some(download) = self.in_flight.get(key) {
                outstanding.push((download.progress().clone(), download.token().clone()));
            }
            for dependency in self.dependencies.get(key).into_iter().flatten() {
                if visited.insert(dependency.as_str()) {
                    queue.push(dependency.as_str());
                }
            }
        }
        outstanding
    }

    pub fn cancellation_token(&self, key: &str) -> Option<CancellationToken> {
        self.in_flight.get(key).map(|download| download.token().clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
