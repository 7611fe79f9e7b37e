//! A single in-flight bundle download.

use crate::transport::Transport;
use crate::{BundleKey, ContentVersion};
use futures::FutureExt;
use haul_storage::Progress;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Failure reason recorded for a download stopped through its token.
pub const CANCELLED: &str = "cancelled";

pub(crate) type Outcome = Result<Vec<u8>, String>;

/// Transport fetch running on its own task.
///
/// Nothing here blocks: the orchestrator checks [`try_finish`](Self::try_finish)
/// once per tick and picks up the outcome when the task is done. Dropping a
/// download aborts its task.
pub(crate) struct Download {
    pub(crate) version: Option<ContentVersion>,
    progress: Progress,
    token: CancellationToken,
    task: JoinHandle<Outcome>,
    /// Requests that arrived for this key while it was in flight, including
    /// the one that started it. Becomes the cached reference count.
    pub(crate) requests: usize,
}

impl Download {
    pub(crate) fn spawn(
        runtime: &Handle,
        transport: Transport,
        key: BundleKey,
        version: Option<ContentVersion>,
    ) -> Self {
        let progress = Progress::default();
        let token = CancellationToken::new();
        let span = tracing::debug_span!("download", key = %key);
        let task = runtime.spawn(
            {
                let progress = progress.clone();
                let token = token.clone();
                let version = version.clone();
                async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => Err(CANCELLED.to_string()),
                        result = transport.fetch(&key, version.as_ref(), &progress) => result.map_err(|e| e.reason()),
                    }
                }
            }
            .instrument(span),
        );
        Self { version, progress, token, task, requests: 1 }
    }

    /// The outcome, once the task has finished. Returns `None` while it is
    /// still running, and after the outcome has been taken.
    pub(crate) fn try_finish(&mut self) -> Option<Outcome> {
        if !self.task.is_finished() {
            return None;
        }
        match (&mut self.task).now_or_never()? {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_cancelled() => Some(Err(CANCELLED.to_string())),
            Err(e) => Some(Err(format!("download task failed: {e}"))),
        }
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_storage::backend::MockBackend;
    use std::sync::Arc;

    async fn finish(download: &mut Download) -> Outcome {
        for _ in 0..64 {
            if let Some(outcome) = download.try_finish() {
                return outcome;
            }
            tokio::task::yield_now().await;
        }
        panic!("download never finished");
    }

    #[tokio::test]
    async fn test_download_completes() {
        let transport = Transport::new(Arc::new(MockBackend::with_files([("cube0", b"data")])));
        let mut download = Download::spawn(&Handle::current(), transport, BundleKey::new("cube0"), None);
        assert_eq!(finish(&mut download).await.unwrap(), b"data");
        assert!(download.progress().is_finished());
    }

    #[tokio::test]
    async fn test_failure_reason() {
        let backend = MockBackend::with_files([("cube2", b"data")]).with_failure("cube2", "404");
        let mut download = Download::spawn(&Handle::current(), Transport::new(Arc::new(backend)), "cube2".into(), None);
        assert_eq!(finish(&mut download).await.unwrap_err(), "404");
    }

    #[tokio::test]
    async fn test_cancel_while_held() {
        let backend = Arc::new(MockBackend::with_files([("cube0", b"data")]));
        let _hold = backend.hold("cube0").await;
        let mut download = Download::spawn(&Handle::current(), Transport::new(backend), "cube0".into(), None);
        tokio::task::yield_now().await;
        assert!(download.try_finish().is_none());
        download.cancel();
        assert!(download.token().is_cancelled());
        assert_eq!(finish(&mut download).await.unwrap_err(), CANCELLED);
    }
}
