//! Paged fetch + normalize + upsert for a single tick — `spec.md` §4.3.2–4.3.3.
//!
//! Grounded on `binance::client::BinanceClient`'s retry/backoff loop, adapted
//! from a single-request retry to the page-and-sub-batch two-level retry this
//! spec requires, with bounded page concurrency via `tokio::sync::Semaphore`
//! (the pack's worker-pool idiom) instead of the teacher's sequential calls.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::provider::{MarketDataProvider, ProviderError};
use crate::sink::{Event, EventSink, Kind, Level};
use crate::store::{GatewayPort, SnapshotRow, SyncLogRow};
use crate::time::Clock;
use crate::types::{Millis, TickOutcome};

use super::normalize::normalize;

const PAGE_BACKOFF_BASE_MS: u64 = 1_000;
const PAGE_BACKOFF_FACTOR: u64 = 2;
const PAGE_BACKOFF_CAP_MS: u64 = 30_000;
const PAGE_BACKOFF_JITTER: f64 = 0.2;

/// Outcome of one tick's fetch-and-write, with the metrics `spec.md` §4.3.3
/// requires on the emitted event.
pub struct TickReport {
    pub outcome: TickOutcome,
    pub pages_ok: u32,
    pub pages_failed: u32,
    pub rows_written: u64,
    pub duration_ms: i64,
    pub aligned_time_ms: Millis,
    pub first_error: Option<String>,
}

/// Runs one complete tick: enumerate pages, normalize rows, upsert in
/// sub-batches, and report the tick's terminal outcome (`spec.md` §4.3.3).
pub struct Fetcher {
    provider: Arc<dyn MarketDataProvider>,
    gateway: Arc<dyn GatewayPort>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl Fetcher {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn GatewayPort>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            provider,
            gateway,
            sink,
            clock,
            config,
        }
    }

    #[instrument(skip(self, cancel), fields(aligned_time_ms))]
    pub async fn run_tick(&self, cancel: &CancellationToken) -> TickReport {
        let raw_time_ms = self.clock.now_ms();
        let aligned_time_ms = crate::types::align(raw_time_ms, self.config.bucket_ms);
        tracing::Span::current().record("aligned_time_ms", aligned_time_ms);

        self.sink
            .emit(Event::new(
                &self.config.service_name,
                Kind::SyncStart,
                Level::Info,
                "tick started",
                raw_time_ms,
            ))
            .await;

        let first_error: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
        let pages_ok = Arc::new(AtomicU32::new(0));
        let pages_failed = Arc::new(AtomicU32::new(0));
        let rows_written = Arc::new(AtomicU64::new(0));

        // Pages are fetched in waves of `concurrency` at a time: within a
        // wave all requests run concurrently (bounded by the semaphore, per
        // `spec.md` §5), but the next wave is only started once this one's
        // results are known, so pagination can stop as soon as a short page
        // is observed (`spec.md` §6.1) without overshooting `page_cap`.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut next_page = 1u32;
        let mut reached_end = false;

        while !reached_end && next_page <= self.config.page_cap && !cancel.is_cancelled() {
            let wave_end = (next_page + self.config.concurrency as u32 - 1).min(self.config.page_cap);
            let mut wave = tokio::task::JoinSet::new();

            for page in next_page..=wave_end {
                let permit_fut = semaphore.clone().acquire_owned();
                let provider = self.provider.clone();
                let clock = self.clock.clone();
                let retries = self.config.retries;
                let page_size = self.config.page_size;
                let aligned_time = aligned_time_ms;
                let gateway = self.gateway.clone();
                let sub_batch_size = self.config.sub_batch_size;
                let first_error_handle = first_error.clone();
                let pages_ok_handle = pages_ok.clone();
                let pages_failed_handle = pages_failed.clone();
                let rows_written_handle = rows_written.clone();

                wave.spawn(async move {
                    let _permit = permit_fut.await.expect("semaphore never closes");

                    match fetch_page_with_retry(provider.as_ref(), clock.as_ref(), page, page_size, retries).await {
                        Ok(p) => {
                            let is_last = p.is_last();
                            let rows: Vec<SnapshotRow> = p
                                .assets
                                .into_iter()
                                .filter_map(|raw| normalize(raw, aligned_time, raw_time_ms))
                                .collect();

                            pages_ok_handle.fetch_add(1, Ordering::Relaxed);

                            for chunk in rows.chunks(sub_batch_size) {
                                match upsert_with_retry(gateway.as_ref(), clock.as_ref(), chunk, retries).await {
                                    Ok(()) => {
                                        rows_written_handle.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        pages_failed_handle.fetch_add(1, Ordering::Relaxed);
                                        record_first_error(&first_error_handle, e.to_string());
                                    }
                                }
                            }
                            is_last
                        }
                        Err(reason) => {
                            pages_failed_handle.fetch_add(1, Ordering::Relaxed);
                            record_first_error(&first_error_handle, reason);
                            // Treat a terminally-failed page as non-last so the
                            // wave's other pages are still judged on their own
                            // merits; pagination still stops at `page_cap`.
                            false
                        }
                    }
                });
            }

            while let Some(joined) = wave.join_next().await {
                if matches!(joined, Ok(true)) {
                    reached_end = true;
                }
            }

            next_page = wave_end + 1;
        }

        let duration_ms = self.clock.now_ms() - raw_time_ms;
        let pages_ok = pages_ok.load(Ordering::Relaxed);
        let pages_failed = pages_failed.load(Ordering::Relaxed);
        let rows_written = rows_written.load(Ordering::Relaxed);
        let first_error = first_error.lock().unwrap().clone();

        let outcome = if pages_failed == 0 {
            TickOutcome::Success
        } else if rows_written > 0 {
            TickOutcome::Partial
        } else {
            TickOutcome::Failure
        };

        self.emit_outcome(outcome, pages_ok, pages_failed, rows_written, duration_ms, aligned_time_ms)
            .await;

        let log_row = SyncLogRow {
            tick_id: uuid::Uuid::new_v4(),
            tick_started_at: chrono::DateTime::from_timestamp_millis(raw_time_ms).unwrap_or_else(chrono::Utc::now),
            tick_ended_at: chrono::Utc::now(),
            pages_attempted: (pages_ok + pages_failed) as i32,
            pages_succeeded: pages_ok as i32,
            rows_written: rows_written as i64,
            status: match outcome {
                TickOutcome::Success => "success",
                TickOutcome::Partial => "partial",
                TickOutcome::Failure => "failure",
            },
            first_error: first_error.clone(),
        };
        if let Err(e) = self.gateway.append_sync_log(&log_row).await {
            warn!(%e, "failed to append sync log row");
        }

        TickReport {
            outcome,
            pages_ok,
            pages_failed,
            rows_written,
            duration_ms,
            aligned_time_ms,
            first_error,
        }
    }

    async fn emit_outcome(
        &self,
        outcome: TickOutcome,
        pages_ok: u32,
        pages_failed: u32,
        rows_written: u64,
        duration_ms: i64,
        aligned_time_ms: Millis,
    ) {
        let (kind, level, message) = match outcome {
            TickOutcome::Success => (Kind::SyncSuccess, Level::Info, "tick completed"),
            TickOutcome::Partial => (Kind::SyncPartial, Level::Warn, "tick partially completed"),
            TickOutcome::Failure => (Kind::SyncFailure, Level::Error, "tick failed"),
        };
        let event = Event::new(&self.config.service_name, kind, level, message, self.clock.now_ms())
            .with_metric("pages_ok", pages_ok as f64)
            .with_metric("pages_failed", pages_failed as f64)
            .with_metric("rows_written", rows_written as f64)
            .with_metric("duration_ms", duration_ms as f64)
            .with_metric("aligned_time_ms", aligned_time_ms as f64);
        self.sink.emit(event).await;
    }
}

fn record_first_error(slot: &std::sync::Mutex<Option<String>>, msg: String) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(crate::error::truncate_terminal_message(&msg));
    }
}

/// Fetch one page, retrying on transient failure per `spec.md` §4.3.2:
/// exponential backoff (base 1 s, factor 2, jitter ±20%, cap 30 s), honoring
/// any server `Retry-After` in place of the computed delay.
async fn fetch_page_with_retry(
    provider: &dyn MarketDataProvider,
    clock: &dyn Clock,
    page: u32,
    page_size: u32,
    retries: u32,
) -> Result<crate::provider::Page, String> {
    let mut attempt = 0u32;
    loop {
        match provider.fetch_page(page, page_size).await {
            Ok(p) => return Ok(p),
            Err(ProviderError::Terminal { page, reason }) => {
                warn!(page, reason, "page failed terminally");
                return Err(reason);
            }
            Err(ProviderError::Transient { source, retry_after }) => {
                attempt += 1;
                if attempt > retries {
                    return Err(source.to_string());
                }
                let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt, PAGE_BACKOFF_BASE_MS, PAGE_BACKOFF_FACTOR, PAGE_BACKOFF_CAP_MS));
                warn!(page, attempt, delay_ms = delay.as_millis() as u64, %source, "retrying page after transient error");
                clock.sleep(delay).await;
            }
        }
    }
}

async fn upsert_with_retry(gateway: &dyn GatewayPort, clock: &dyn Clock, rows: &[SnapshotRow], retries: u32) -> Result<(), crate::error::IngestError> {
    let mut attempt = 0u32;
    loop {
        match gateway.upsert_snapshots(rows).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt > retries {
                    return Err(e);
                }
                let delay = backoff_delay(attempt, PAGE_BACKOFF_BASE_MS, PAGE_BACKOFF_FACTOR, PAGE_BACKOFF_CAP_MS);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %e, "retrying sub-batch upsert");
                clock.sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `min(base * factor^(attempt-1), cap)`, jittered by up to `±jitter_frac`.
fn backoff_delay(attempt: u32, base_ms: u64, factor: u64, cap_ms: u64) -> Duration {
    let raw = base_ms.saturating_mul(factor.saturating_pow(attempt.saturating_sub(1)));
    let capped = raw.min(cap_ms);
    let jitter_span = (capped as f64 * PAGE_BACKOFF_JITTER) as i64;
    let jitter = if jitter_span > 0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0
    };
    let jittered = (capped as i64 + jitter).max(0) as u64;
    Duration::from_millis(jittered)
}

/// Did this tick exceed its `2Δ` deadline? Used by the scheduler to decide
/// whether to abort in-flight work (`spec.md` §5).
pub fn exceeded_deadline(started_ms: Millis, now_ms: Millis, deadline_ms: i64) -> bool {
    now_ms - started_ms > deadline_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::time::test_util::VirtualClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32 as RetryCount;
    use std::sync::Mutex;

    /// Fails the first `fail_times` calls with a transient error, then
    /// succeeds; records every row batch it actually commits.
    struct FlakyGateway {
        fail_times: u32,
        calls: RetryCount,
        written: Mutex<Vec<Vec<SnapshotRow>>>,
    }

    #[async_trait]
    impl GatewayPort for FlakyGateway {
        async fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> Result<(), IngestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(IngestError::Transient(anyhow::anyhow!("simulated transient failure")));
            }
            self.written.lock().unwrap().push(rows.to_vec());
            Ok(())
        }
        async fn upsert_indicators(&self, _rows: &[crate::store::IndicatorRow]) -> Result<(), IngestError> {
            Ok(())
        }
        async fn latest_bucket(&self) -> Result<Option<Millis>, IngestError> {
            Ok(None)
        }
        async fn history_window(&self, _t: Millis, _offsets: &[i64]) -> Result<Vec<crate::store::HistoryRow>, IngestError> {
            Ok(vec![])
        }
        async fn latest_indicator_bucket(&self) -> Result<Option<Millis>, IngestError> {
            Ok(None)
        }
        async fn append_sync_log(&self, _row: &SyncLogRow) -> Result<(), IngestError> {
            Ok(())
        }
    }

    /// Drives `upsert_with_retry` through its backoff path deterministically:
    /// the virtual clock only advances through `sleep`, so a successful retry
    /// after simulated transient failures proves the backoff is driven by the
    /// injected `Clock`, not a real `tokio::time::sleep`.
    #[tokio::test]
    async fn upsert_with_retry_backs_off_through_injected_clock_then_succeeds() {
        let gateway = FlakyGateway {
            fail_times: 2,
            calls: RetryCount::new(0),
            written: Mutex::new(vec![]),
        };
        let clock = VirtualClock::new(0);
        let rows = vec![];

        let result = upsert_with_retry(&gateway, &clock, &rows, 3).await;
        assert!(result.is_ok());
        assert_eq!(gateway.written.lock().unwrap().len(), 1);
        // Two retries' worth of backoff delay were observed only via the
        // injected clock advancing, never a real sleep.
        assert!(clock.now_ms() > 0);
    }

    #[tokio::test]
    async fn upsert_with_retry_gives_up_after_exhausting_retries() {
        let gateway = FlakyGateway {
            fail_times: 10,
            calls: RetryCount::new(0),
            written: Mutex::new(vec![]),
        };
        let clock = VirtualClock::new(0);
        let rows = vec![];

        let result = upsert_with_retry(&gateway, &clock, &rows, 2).await;
        assert!(result.is_err());
        assert!(gateway.written.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay(1, 1_000, 2, 30_000);
        assert!(d1.as_millis() as i64 >= 800 && d1.as_millis() as i64 <= 1_200);

        let d5 = backoff_delay(5, 1_000, 2, 30_000);
        // Uncapped would be 16_000ms; with jitter still well under cap.
        assert!(d5.as_millis() <= 30_000);

        let d10 = backoff_delay(10, 1_000, 2, 30_000);
        assert!(d10.as_millis() as i64 <= (30_000.0 * 1.2) as i64);
    }

    #[test]
    fn deadline_check() {
        assert!(!exceeded_deadline(0, 100, 360_000));
        assert!(exceeded_deadline(0, 400_000, 360_000));
    }
}
