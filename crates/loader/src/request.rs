//! Pollable load requests.
//!
//! A [`LoadRequest`] is the caller's side of one asset load. The loader keeps
//! the other side and moves it forward once per tick:
//!
//! ```text
//! AwaitingBundle ──ready──▶ Extracting ──finished──▶ Done
//!        │
//!        └──────failed────▶ Failed
//! ```
//!
//! Only one transition happens per tick, so a bundle that lands in tick N has
//! its extraction started in tick N and is `Done` in tick N+1 at the earliest.

use crate::error::{ErrorKind, Result};
use crate::extract::{Asset, AssetObject, ExtractorHandle};
use crate::orchestrator::{Orchestrator, Readiness};
use crate::wait::{Progressing, StallTimeout};
use crate::{BundleKey, Manifest};
use futures::FutureExt;
use haul_storage::Progress;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a poll of a [`LoadRequest`] found.
#[derive(Debug)]
pub enum LoadStatus<T> {
    Pending,
    /// `None` when the bundle has no asset of that name and type.
    Ready(Option<Arc<T>>),
    Failed(ErrorKind),
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    AwaitingBundle,
    Extracting,
    Done,
    Failed,
}
impl LoadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    Asset,
    /// Installs the extracted manifest into the orchestrator when done.
    Manifest,
}

enum Stage {
    Awaiting,
    Extracting(JoinHandle<Option<AssetObject>>),
    Done(Option<AssetObject>),
    Failed(ErrorKind),
}

pub(crate) struct RequestInner {
    key: Option<BundleKey>,
    asset: String,
    kind: &'static str,
    purpose: Purpose,
    stage: Stage,
    /// Downloads still outstanding in the bundle's dependency closure,
    /// refreshed on every tick while awaiting it.
    downloads: Vec<(Progress, CancellationToken)>,
}

pub(crate) type SharedRequest = Arc<Mutex<RequestInner>>;

pub(crate) fn lock(request: &Mutex<RequestInner>) -> MutexGuard<'_, RequestInner> {
    // A panic elsewhere can't leave a stage half-written; keep going.
    request.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestInner {
    pub(crate) fn new(
        key: BundleKey,
        asset: String,
        kind: &'static str,
        purpose: Purpose,
        orchestrator: &Orchestrator,
    ) -> Self {
        Self {
            downloads: orchestrator.outstanding(key.as_str()),
            key: Some(key),
            asset,
            kind,
            purpose,
            stage: Stage::Awaiting,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Done(_) | Stage::Failed(_))
    }

    /// Move one step. Returns `true` once the request is terminal.
    pub(crate) fn advance(
        &mut self,
        orchestrator: &mut Orchestrator,
        extractor: &ExtractorHandle,
        runtime: &Handle,
    ) -> bool {
        let Some(key) = self.key.clone() else {
            return self.is_terminal();
        };
        match &mut self.stage {
            Stage::Awaiting => match orchestrator.get_ready(key.as_str()) {
                Readiness::Pending => self.downloads = orchestrator.outstanding(key.as_str()),
                Readiness::Failed { key: failed, error, .. } => {
                    tracing::debug!(key = %key, failed = %failed, "Load request failed");
                    self.downloads.clear();
                    self.stage = Stage::Failed(ErrorKind::Transport { key: failed, reason: error });
                },
                Readiness::Ready(bundle) => {
                    tracing::debug!(key = %key, asset = %self.asset, kind = self.kind, "Extracting asset");
                    let extractor = extractor.clone();
                    let asset = self.asset.clone();
                    let kind = self.kind;
                    let task = runtime.spawn_blocking(move || extractor.extract(&bundle, &asset, kind));
                    self.downloads.clear();
                    self.stage = Stage::Extracting(task);
                },
            },
            Stage::Extracting(task) => {
                if task.is_finished()
                    && let Some(joined) = task.now_or_never()
                {
                    self.stage = match joined {
                        Ok(object) => {
                            if object.is_none() {
                                tracing::debug!(key = %key, asset = %self.asset, "Asset not found in bundle");
                            }
                            if self.purpose == Purpose::Manifest {
                                self.install(orchestrator, object.as_ref());
                            }
                            Stage::Done(object)
                        },
                        Err(e) => Stage::Failed(ErrorKind::Extraction(e.to_string())),
                    };
                }
            },
            Stage::Done(_) | Stage::Failed(_) => (),
        }
        self.is_terminal()
    }

    fn install(&self, orchestrator: &mut Orchestrator, object: Option<&AssetObject>) {
        match object.cloned().map(|object| object.downcast::<Manifest>()) {
            Some(Ok(manifest)) => orchestrator.install_manifest(manifest),
            _ => tracing::warn!(asset = %self.asset, "Manifest bundle does not contain a manifest"),
        }
    }

    /// Stop a request that hasn't finished yet.
    pub(crate) fn abort(&mut self, error: ErrorKind) {
        if let Stage::Extracting(task) = &self.stage {
            task.abort();
        }
        if !self.is_terminal() {
            self.stage = Stage::Failed(error);
        }
        self.downloads.clear();
    }
}

/// Handle to one asset load.
///
/// Cloning gives another handle to the same load. Handles stay valid after
/// the loader has dropped the request from its poll set, and keep answering
/// with the final result.
pub struct LoadRequest<T> {
    inner: SharedRequest,
    _asset: PhantomData<fn() -> T>,
}
impl<T> Clone for LoadRequest<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), _asset: PhantomData }
    }
}

impl<T: Asset> LoadRequest<T> {
    pub(crate) fn new(inner: SharedRequest) -> Self {
        Self { inner, _asset: PhantomData }
    }

    /// A request that is already done, holding `value`. Useful where code
    /// expects a load but the asset is at hand, as in tests.
    pub fn simulated(asset: impl Into<String>, value: T) -> Self {
        let inner = RequestInner {
            key: None,
            asset: asset.into(),
            kind: T::KIND,
            purpose: Purpose::Asset,
            stage: Stage::Done(Some(Arc::new(value) as AssetObject)),
            downloads: Vec::new(),
        };
        Self::new(Arc::new(Mutex::new(inner)))
    }

    pub fn poll(&self) -> LoadStatus<T> {
        match &lock(&self.inner).stage {
            Stage::Awaiting | Stage::Extracting(_) => LoadStatus::Pending,
            Stage::Done(object) => LoadStatus::Ready(object.clone().and_then(|object| object.downcast::<T>().ok())),
            Stage::Failed(error) => LoadStatus::Failed(error.clone()),
        }
    }

    pub fn state(&self) -> LoadState {
        match lock(&self.inner).stage {
            Stage::Awaiting => LoadState::AwaitingBundle,
            Stage::Extracting(_) => LoadState::Extracting,
            Stage::Done(_) => LoadState::Done,
            Stage::Failed(_) => LoadState::Failed,
        }
    }

    /// Bundle key this request loads from; `None` for simulated requests.
    pub fn key(&self) -> Option<BundleKey> {
        lock(&self.inner).key.clone()
    }

    pub fn asset(&self) -> String {
        lock(&self.inner).asset.clone()
    }

    /// While awaiting the bundle, the progress of the least advanced download
    /// among the bundle and its dependencies. `1.0` once nothing is left to
    /// download.
    pub fn progress(&self) -> f32 {
        let inner = lock(&self.inner);
        match &inner.stage {
            Stage::Awaiting => inner.downloads.iter().map(|(progress, _)| progress.ratio()).fold(1.0, f32::min),
            _ => 1.0,
        }
    }

    /// Wait until the request is done, giving up when it stalls.
    ///
    /// Something has to keep ticking the loader meanwhile, usually a
    /// [`Driver`](crate::Driver).
    pub async fn wait(&self, timeout: &StallTimeout) -> Result<Option<Arc<T>>> {
        timeout.wait(self).await?;
        match self.poll() {
            LoadStatus::Ready(asset) => Ok(asset),
            LoadStatus::Failed(error) => Err(error.into()),
            LoadStatus::Pending => unreachable!("stall wait returned before the request finished"),
        }
    }
}

impl<T: Asset> Progressing for LoadRequest<T> {
    fn is_terminal(&self) -> bool {
        lock(&self.inner).is_terminal()
    }

    fn progress(&self) -> f32 {
        LoadRequest::progress(self)
    }

    /// Cancels every download the request is still waiting on, shared
    /// dependencies included.
    fn cancel(&self) -> bool {
        let inner = lock(&self.inner);
        for (_, token) in &inner.downloads {
            token.cancel();
        }
        !inner.downloads.is_empty()
    }
}
