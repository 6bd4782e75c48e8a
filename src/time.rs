//! Clock abstraction for the scheduler and indicator engine.
//!
//! `spec.md` §9 calls for "a single central timer primitive ... testable by
//! substituting a virtual clock" in place of ad-hoc sleep loops. `SystemClock`
//! is what runs in production; `VirtualClock` (test-only) lets scheduler and
//! engine tests advance time deterministically without real sleeps, in the
//! spirit of `SimClock` in the teacher pack's `cooprefr-bettersys` backtest
//! harness, adapted here from nanosecond simulation time to the wall-clock +
//! monotonic-delay split this system actually needs.

use std::time::Duration;

use crate::types::Millis;

/// Source of both wall-clock time (for alignment and logging) and
/// cancellable delays (for interval measurement), per `spec.md` §4.3.1.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC wall-clock time, integer milliseconds since the epoch.
    fn now_ms(&self) -> Millis;

    /// Suspend for `d`. Real time for `SystemClock`; resolved instantly (or
    /// under explicit test control) for `VirtualClock`.
    async fn sleep(&self, d: Duration);
}

/// Production clock backed by `std::time` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Test-only clock whose `now_ms()` is fixed by the test and whose `sleep`
/// returns immediately. Lets scheduler/engine tests assert on alignment and
/// ordering without waiting on real wall-clock time.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug)]
    pub struct VirtualClock {
        now: AtomicI64,
    }

    impl VirtualClock {
        pub fn new(start_ms: Millis) -> Self {
            Self {
                now: AtomicI64::new(start_ms),
            }
        }

        pub fn advance(&self, d: Duration) {
            self.now.fetch_add(d.as_millis() as i64, Ordering::SeqCst);
        }

        pub fn set(&self, ms: Millis) {
            self.now.store(ms, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Clock for VirtualClock {
        fn now_ms(&self) -> Millis {
            self.now.load(Ordering::SeqCst)
        }

        async fn sleep(&self, d: Duration) {
            // No real delay: tests drive time explicitly via `advance`/`set`.
            self.advance(d);
        }
    }
}
