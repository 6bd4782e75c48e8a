//! Ingest Scheduler — `spec.md` §4.3.1, §4.3.4, §5.
//!
//! Fires a tick at each bucket boundary and immediately on startup, guarantees
//! non-overlap, enforces the `2Δ` tick deadline, and honors cooperative
//! cancellation. Grounded on the teacher's central-timer idiom (replacing its
//! ad-hoc sleep loops per `spec.md` §9's Design Note), driven through the
//! [`Clock`](crate::time::Clock) abstraction so scheduling logic is testable
//! with a virtual clock instead of real sleeps.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::sink::{Event, EventSink, Kind, Level};
use crate::time::Clock;
use crate::types::{align, Millis};

use super::fetcher::Fetcher;

/// `Idle → Running → {Commit, Aborting} → Idle`, per `spec.md` §4.3.4.
/// `Commit` and `Aborting` are not held as distinct states here — they
/// collapse into the tick's `TickOutcome`, which is all a caller can
/// observe once a tick finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Drives the Fetcher at fixed-cadence bucket boundaries.
pub struct Scheduler {
    fetcher: Arc<Fetcher>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: Config,
    // A 1-permit semaphore enforces non-overlap without blocking the
    // scheduler's own boundary timer: `try_acquire` either wins the tick or
    // the tick is skipped with an `info` event, per `spec.md` §4.3.1.
    run_gate: Semaphore,
}

impl Scheduler {
    pub fn new(fetcher: Arc<Fetcher>, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            fetcher,
            sink,
            clock,
            config,
            run_gate: Semaphore::new(1),
        }
    }

    /// Run until `cancel` fires. Ticks once at startup (catch-up of the
    /// current bucket) and then at every subsequent boundary.
    pub async fn run(&self, cancel: CancellationToken) {
        self.run_one_tick(&cancel).await;

        loop {
            let now = self.clock.now_ms();
            let next_boundary = align(now, self.config.bucket_ms) + self.config.bucket_ms;
            let wait_ms = (next_boundary - now).max(0) as u64;

            tokio::select! {
                _ = self.clock.sleep(std::time::Duration::from_millis(wait_ms)) => {}
                _ = cancel.cancelled() => break,
            }

            if cancel.is_cancelled() {
                break;
            }

            let woke_at = self.clock.now_ms();
            if let Some(skipped) = skipped_boundaries(next_boundary, woke_at, self.config.bucket_ms) {
                info!(skipped_buckets = skipped, expected_boundary_ms = next_boundary, "clock jumped forward; skipping missed bucket boundary");
                self.sink
                    .emit(
                        Event::new(&self.config.service_name, Kind::Health, Level::Info, "clock jumped forward; skipping missed bucket boundary", woke_at)
                            .with_metric("skipped_buckets", skipped as f64)
                            .with_metric("expected_boundary_ms", next_boundary as f64),
                    )
                    .await;
            }
            self.run_one_tick(&cancel).await;
        }
    }

    async fn run_one_tick(&self, cancel: &CancellationToken) {
        let permit = match self.run_gate.try_acquire() {
            Ok(p) => p,
            Err(_) => {
                info!("skipping tick: previous tick still running");
                self.sink
                    .emit(Event::new(
                        &self.config.service_name,
                        Kind::Health,
                        Level::Info,
                        "tick skipped: previous tick still running",
                        self.clock.now_ms(),
                    ))
                    .await;
                return;
            }
        };

        let started_ms = self.clock.now_ms();
        let deadline_ms = self.config.tick_deadline_ms();
        let tick_cancel = cancel.child_token();

        let fetcher = self.fetcher.clone();
        let clock = self.clock.clone();
        let tick_cancel_for_timer = tick_cancel.clone();
        let deadline_task = tokio::spawn(async move {
            loop {
                let elapsed = clock.now_ms() - started_ms;
                let remaining = (deadline_ms - elapsed).max(0) as u64;
                tokio::select! {
                    _ = clock.sleep(std::time::Duration::from_millis(remaining)) => {
                        tick_cancel_for_timer.cancel();
                        break;
                    }
                    _ = tick_cancel_for_timer.cancelled() => break,
                }
            }
        });

        let report = fetcher.run_tick(&tick_cancel).await;
        tick_cancel.cancel();
        deadline_task.abort();

        info!(
            outcome = %report.outcome,
            pages_ok = report.pages_ok,
            pages_failed = report.pages_failed,
            rows_written = report.rows_written,
            duration_ms = report.duration_ms,
            "tick finished"
        );

        drop(permit);
    }
}

/// `Some(n)` — the number of extra bucket boundaries silently missed — when
/// the clock has jumped forward past `expected_boundary` by more than one
/// bucket (`spec.md` §8: "clock jump forward by one bucket during a tick").
/// `None` when the wake lands on schedule.
fn skipped_boundaries(expected_boundary: Millis, woke_at: Millis, bucket_ms: Millis) -> Option<u64> {
    let actual_boundary = align(woke_at, bucket_ms);
    if actual_boundary > expected_boundary {
        Some(((actual_boundary - expected_boundary) / bucket_ms) as u64)
    } else {
        None
    }
}

/// True if the scheduler's gate is currently held (a tick is `Running`).
/// Exposed for tests asserting non-overlap (`spec.md` P6).
#[cfg(any(test, feature = "test-util"))]
pub fn is_running(scheduler: &Scheduler) -> bool {
    scheduler.run_gate.available_permits() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MarketDataProvider, Page, ProviderError};
    use crate::sink::LogSink;
    use crate::store::{GatewayPort, HistoryRow, IndicatorRow, SnapshotRow, SyncLogRow};
    use crate::time::test_util::VirtualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EmptyProvider;
    #[async_trait]
    impl MarketDataProvider for EmptyProvider {
        async fn fetch_page(&self, _page: u32, per_page: u32) -> Result<Page, ProviderError> {
            Ok(Page {
                assets: vec![],
                requested_per_page: per_page,
            })
        }
    }

    struct NoopGateway {
        upserts: AtomicU32,
    }
    #[async_trait]
    impl GatewayPort for NoopGateway {
        async fn upsert_snapshots(&self, _rows: &[SnapshotRow]) -> Result<(), crate::error::IngestError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn upsert_indicators(&self, _rows: &[IndicatorRow]) -> Result<(), crate::error::IngestError> {
            Ok(())
        }
        async fn latest_bucket(&self) -> Result<Option<Millis>, crate::error::IngestError> {
            Ok(None)
        }
        async fn history_window(&self, _t: Millis, _offsets: &[i64]) -> Result<Vec<HistoryRow>, crate::error::IngestError> {
            Ok(vec![])
        }
        async fn latest_indicator_bucket(&self) -> Result<Option<Millis>, crate::error::IngestError> {
            Ok(None)
        }
        async fn append_sync_log(&self, _row: &SyncLogRow) -> Result<(), crate::error::IngestError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            bucket_ms: 180_000,
            page_size: 250,
            page_cap: 1,
            concurrency: 2,
            retries: 1,
            rate_limit_rps: 0.0,
            poll_interval_s: 3,
            safety_delay_s: 5,
            sub_batch_size: 1_000,
            quote_currency: "usd".into(),
            log_level: "info".into(),
            service_name: "reftick-test".into(),
            db_dsn: String::new(),
            api_base_url: String::new(),
            api_key: String::new(),
            webhook_urls: vec![],
        }
    }

    #[tokio::test]
    async fn startup_tick_runs_immediately() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new(1_700_000_030_000));
        let gateway = Arc::new(NoopGateway { upserts: AtomicU32::new(0) });
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(EmptyProvider),
            gateway.clone(),
            Arc::new(LogSink::new("test")),
            clock.clone(),
            test_config(),
        ));
        let scheduler = Scheduler::new(fetcher, Arc::new(LogSink::new("test")), clock, test_config());
        scheduler.run_one_tick(&CancellationToken::new()).await;
        assert!(!is_running(&scheduler));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new(0));
        let gateway = Arc::new(NoopGateway { upserts: AtomicU32::new(0) });
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(EmptyProvider),
            gateway,
            Arc::new(LogSink::new("test")),
            clock.clone(),
            test_config(),
        ));
        let scheduler = Scheduler::new(fetcher, Arc::new(LogSink::new("test")), clock, test_config());

        // Manually hold the gate to simulate an in-flight tick, then assert
        // a second attempt is skipped rather than blocking.
        let permit = scheduler.run_gate.try_acquire().unwrap();
        assert!(scheduler.run_gate.try_acquire().is_err());
        drop(permit);
    }

    #[test]
    fn skipped_boundaries_detects_clock_jump_past_next_boundary() {
        let bucket_ms = 180_000;
        let expected = 1_000 * bucket_ms;
        // Wake exactly on schedule: nothing skipped.
        assert_eq!(skipped_boundaries(expected, expected, bucket_ms), None);
        // Wake one bucket past schedule: one boundary silently missed.
        assert_eq!(skipped_boundaries(expected, expected + bucket_ms, bucket_ms), Some(1));
        // Wake three buckets past schedule.
        assert_eq!(skipped_boundaries(expected, expected + 3 * bucket_ms, bucket_ms), Some(3));
        // Wake a few ms late but still within the same bucket: no skip.
        assert_eq!(skipped_boundaries(expected, expected + 500, bucket_ms), None);
    }
}
