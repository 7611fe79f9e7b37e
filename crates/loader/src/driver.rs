//! Background ticking for async callers.

use crate::Loader;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A [`Loader`] behind a mutex, shared between the driver and callers.
///
/// Hold the guard only for synchronous work; never across an `.await`.
#[derive(Clone)]
pub struct SharedLoader(Arc<Mutex<Loader>>);

impl SharedLoader {
    pub fn new(loader: Loader) -> Self {
        Self(Arc::new(Mutex::new(loader)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Loader> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ticks a [`SharedLoader`] on a fixed interval until shut down.
pub struct Driver {
    loader: SharedLoader,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Driver {
    pub fn spawn(loader: SharedLoader, interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current().or_raise(|| ErrorKind::Runtime)?;
        let token = CancellationToken::new();
        // tokio::time::interval panics on a zero period.
        let period = interval.max(Duration::from_millis(1));
        let task = runtime.spawn({
            let loader = loader.clone();
            let token = token.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => {
                            loader.lock().tick();
                        },
                    }
                }
                tracing::debug!("Driver stopped");
            }
        });
        tracing::debug!(interval = ?period, "Driver started");
        Ok(Self { loader, token, task })
    }

    pub fn loader(&self) -> &SharedLoader {
        &self.loader
    }

    /// Stop ticking, then shut the loader down.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Driver task ended abnormally");
        }
        self.loader.lock().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use crate::{JsonExtractor, LoadState, LoaderOptions, Manifest, StallTimeout};
    use haul_storage::backend::MockBackend;
    use serde_json::Value;

    fn shared(backend: MockBackend) -> SharedLoader {
        let loader =
            Loader::new(Transport::new(Arc::new(backend)), Arc::new(JsonExtractor::new()), LoaderOptions::default())
                .unwrap();
        SharedLoader::new(loader)
    }

    #[tokio::test]
    async fn test_driver_ticks_requests_to_completion() {
        let loader = shared(MockBackend::with_files([(
            "cube0",
            br#"{"assets": {"Cube": {"kind": "mesh", "data": {"vertices": 8}}}}"#,
        )]));
        let request = {
            let mut loader = loader.lock();
            loader.install_manifest(Manifest::default().with_bundle("cube0", "a1", [] as [&str; 0]));
            loader.request_load::<Value>("cube0", "Cube").unwrap()
        };
        let driver = Driver::spawn(loader.clone(), Duration::from_millis(1)).unwrap();
        let cube = request.wait(&StallTimeout::default()).await.unwrap().unwrap();
        assert_eq!(cube["vertices"], 8);
        assert_eq!(loader.lock().ref_count("cube0"), Some(1));
        driver.shutdown().await;
        assert!(loader.lock().is_shut_down());
        assert!(!loader.lock().is_cached("cube0"));
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiting_requests() {
        let backend = MockBackend::with_files([("cube0", b"{}")]);
        let _hold = backend.hold("cube0").await;
        let loader = shared(backend);
        let request = {
            let mut loader = loader.lock();
            loader.install_manifest(Manifest::default().with_bundle("cube0", "a1", [] as [&str; 0]));
            loader.request_load::<Value>("cube0", "Cube").unwrap()
        };
        let driver = Driver::spawn(loader, Duration::from_millis(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(request.state(), LoadState::AwaitingBundle);
        driver.shutdown().await;
        assert_eq!(request.state(), LoadState::Failed);
    }
}
