//! Waiting on operations that might never finish.

use crate::error::{ErrorKind, Result};
use haul_config::{StallPolicy, TimingConfig};
use std::time::Duration;
use tokio::time::Instant;

/// Something that finishes eventually and can say how far along it is.
pub trait Progressing {
    fn is_terminal(&self) -> bool;
    /// Between `0.0` and `1.0`.
    fn progress(&self) -> f32;
    /// Cancel the underlying work. Returns `false` when there is nothing left
    /// to cancel.
    fn cancel(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnStall {
    /// Stop waiting and leave the operation running. It may still finish
    /// later; nothing reclaims it if it never does.
    #[default]
    Abandon,
    /// Stop waiting and cancel the operation.
    Cancel,
}
impl From<StallPolicy> for OnStall {
    fn from(policy: StallPolicy) -> Self {
        match policy {
            StallPolicy::Abandon => Self::Abandon,
            StallPolicy::Cancel => Self::Cancel,
        }
    }
}

/// Waits for an operation, giving up when its progress hasn't increased for
/// longer than `limit`.
///
/// An operation reporting `1.0` has nothing left to transfer and is never
/// considered stalled.
#[derive(Debug, Clone, PartialEq)]
pub struct StallTimeout {
    pub limit: Duration,
    pub poll_interval: Duration,
    pub on_stall: OnStall,
}
impl Default for StallTimeout {
    fn default() -> Self {
        Self { limit: Duration::from_secs(5), poll_interval: Duration::from_millis(10), on_stall: OnStall::Abandon }
    }
}

impl StallTimeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit, ..Self::default() }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_on_stall(mut self, on_stall: OnStall) -> Self {
        self.on_stall = on_stall;
        self
    }

    pub fn from_config(timing: &TimingConfig) -> Self {
        Self { limit: timing.stall_limit(), poll_interval: timing.poll_interval(), on_stall: timing.on_stall.into() }
    }

    /// Sleep in `poll_interval` steps until `operation` is terminal.
    ///
    /// # Errors
    ///
    /// [`TimeoutAbandoned`](ErrorKind::TimeoutAbandoned) or
    /// [`TimeoutCancelled`](ErrorKind::TimeoutCancelled), depending on
    /// `on_stall`, when the operation stalled.
    pub async fn wait<P: Progressing + ?Sized>(&self, operation: &P) -> Result<()> {
        let mut last_moved = Instant::now();
        let mut last = 0.0;
        loop {
            if operation.is_terminal() {
                return Ok(());
            }
            let progress = operation.progress();
            if progress > last || progress >= 1.0 {
                last_moved = Instant::now();
            }
            last = progress;
            if last_moved.elapsed() >= self.limit {
                match self.on_stall {
                    OnStall::Abandon => {
                        tracing::warn!(limit = ?self.limit, "Operation stalled; no longer waiting on it");
                        exn::bail!(ErrorKind::TimeoutAbandoned(self.limit));
                    },
                    OnStall::Cancel => {
                        let cancelled = operation.cancel();
                        tracing::warn!(limit = ?self.limit, cancelled, "Operation stalled; cancelling it");
                        exn::bail!(ErrorKind::TimeoutCancelled(self.limit));
                    },
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Reports `progress(polls)` and finishes after `done_after` polls.
    struct Fake {
        polls: AtomicU32,
        done_after: Option<u32>,
        progress: fn(u32) -> f32,
        cancelled: AtomicBool,
    }
    impl Fake {
        fn new(done_after: Option<u32>, progress: fn(u32) -> f32) -> Self {
            Self { polls: AtomicU32::new(0), done_after, progress, cancelled: AtomicBool::new(false) }
        }

        fn stuck() -> Self {
            Self::new(None, |_| 0.0)
        }
    }
    impl Progressing for Fake {
        fn is_terminal(&self) -> bool {
            let polls = self.polls.fetch_add(1, Ordering::Relaxed);
            self.done_after.is_some_and(|after| polls >= after)
        }

        fn progress(&self) -> f32 {
            (self.progress)(self.polls.load(Ordering::Relaxed))
        }

        fn cancel(&self) -> bool {
            !self.cancelled.swap(true, Ordering::Relaxed)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishes_before_limit() {
        let fake = Fake::new(Some(3), |_| 0.0);
        StallTimeout::default().wait(&fake).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_on_stall() {
        let fake = Fake::stuck();
        let started = Instant::now();
        let err = StallTimeout::new(Duration::from_secs(2)).wait(&fake).await.unwrap_err();
        assert_eq!(*err, ErrorKind::TimeoutAbandoned(Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!fake.cancelled.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_on_stall() {
        let fake = Fake::stuck();
        let timeout = StallTimeout::new(Duration::from_secs(1)).with_on_stall(OnStall::Cancel);
        let err = timeout.wait(&fake).await.unwrap_err();
        assert_eq!(*err, ErrorKind::TimeoutCancelled(Duration::from_secs(1)));
        assert!(fake.cancelled.load(Ordering::Relaxed));
    }

    #[rstest]
    #[case::steady(|polls: u32| -> f32 { polls as f32 / 1_000.0 })]
    #[case::nothing_left_to_fetch(|_: u32| -> f32 { 1.0 })]
    #[tokio::test(start_paused = true)]
    async fn test_moving_operation_outlasts_limit(#[case] progress: fn(u32) -> f32) {
        // At 10ms per poll the limit passes long before it finishes.
        let fake = Fake::new(Some(1_000), progress);
        StallTimeout::new(Duration::from_secs(1)).wait(&fake).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_after_partial_progress() {
        let fake = Fake::new(None, |polls| (polls.min(5) as f32) / 10.0);
        let started = Instant::now();
        let err = StallTimeout::new(Duration::from_secs(1)).wait(&fake).await.unwrap_err();
        assert_eq!(*err, ErrorKind::TimeoutAbandoned(Duration::from_secs(1)));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_from_config() {
        let timing = TimingConfig { stall_timeout_secs: 0.5, on_stall: StallPolicy::Cancel, ..TimingConfig::default() };
        let timeout = StallTimeout::from_config(&timing);
        assert_eq!(timeout.limit, Duration::from_millis(500));
        assert_eq!(timeout.poll_interval, Duration::from_millis(10));
        assert_eq!(timeout.on_stall, OnStall::Cancel);
    }
}
