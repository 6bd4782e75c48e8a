//! Indicator Engine — `spec.md` §4.4.
//!
//! Polls the snapshot watermark, waits a safety delay, then catches up every
//! bucket strictly in order (`spec.md` §5 "processes buckets in strictly
//! increasing `aligned_time` order"). Grounded on the same central-timer
//! idiom as the [`Scheduler`](crate::ingest::Scheduler), reusing its
//! backoff-with-cap retry shape from `binance::client` but with the engine's
//! own cap (15 s vs. the fetcher's 30 s) per `spec.md` §4.4.4.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::IngestError;
use crate::sink::{Event, EventSink, Kind, Level};
use crate::store::{GatewayPort, IndicatorRow};
use crate::time::Clock;
use crate::types::Millis;

use super::compute::{compute_all, required_offsets, OffsetRows};

const INDICATOR_BACKOFF_BASE_MS: u64 = 1_000;
const INDICATOR_BACKOFF_FACTOR: u64 = 2;
const INDICATOR_BACKOFF_CAP_MS: u64 = 15_000;
const INDICATOR_BACKOFF_JITTER: f64 = 0.2;
const INDICATOR_SCALE: u32 = 12;

pub struct IndicatorEngine {
    gateway: Arc<dyn GatewayPort>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: Config,
    numeric_failures: AtomicU32,
}

impl IndicatorEngine {
    pub fn new(gateway: Arc<dyn GatewayPort>, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            gateway,
            sink,
            clock,
            config,
            numeric_failures: AtomicU32::new(0),
        }
    }

    /// Run until `cancel` fires. `spec.md` §4.4.1's cold-start rule: if the
    /// indicator table is empty, start one bucket behind the snapshot
    /// watermark so the first poll has exactly one bucket to catch up.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut last_processed: Option<Millis> = match self.gateway.latest_indicator_bucket().await {
            Ok(Some(t)) => Some(t),
            Ok(None) => self
                .gateway
                .latest_bucket()
                .await
                .ok()
                .flatten()
                .map(|t| t - self.config.bucket_ms),
            Err(e) => {
                warn!(%e, "failed to read initial indicator watermark; starting from scratch");
                None
            }
        };

        loop {
            tokio::select! {
                _ = self.clock.sleep(Duration::from_secs(self.config.poll_interval_s)) => {}
                _ = cancel.cancelled() => break,
            }
            if cancel.is_cancelled() {
                break;
            }

            let latest = match self.gateway.latest_bucket().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(%e, "failed to read snapshot watermark");
                    continue;
                }
            };

            let Some(latest) = latest else { continue };
            let has_new_work = last_processed.map(|lp| latest > lp).unwrap_or(true);
            if !has_new_work {
                continue;
            }

            tokio::select! {
                _ = self.clock.sleep(Duration::from_secs(self.config.safety_delay_s)) => {}
                _ = cancel.cancelled() => break,
            }
            if cancel.is_cancelled() {
                break;
            }

            // Catch-up: process every bucket strictly in order, no further
            // safety delay between iterations (spec.md §4.4.3).
            loop {
                let next = last_processed.map(|lp| lp + self.config.bucket_ms).unwrap_or(latest);
                if next > latest {
                    break;
                }
                if cancel.is_cancelled() {
                    break;
                }
                match self.process_bucket(next, &cancel).await {
                    Ok(()) => last_processed = Some(next),
                    Err(_) => break, // watermark does not advance; retry next poll
                }
            }
        }
    }

    /// Process one bucket: fetch its history window, compute indicators,
    /// upsert. `pub` so integration tests in `tests/` can drive catch-up
    /// scenarios bucket-by-bucket without going through the full poll loop.
    pub async fn process_bucket(&self, aligned_time: Millis, cancel: &CancellationToken) -> Result<(), IngestError> {
        self.sink
            .emit(Event::new(
                &self.config.service_name,
                Kind::IndicatorStart,
                Level::Info,
                "indicator computation started",
                self.clock.now_ms(),
            ))
            .await;

        let started_ms = self.clock.now_ms();
        let rows = match self.history_window_with_retry(aligned_time, cancel).await {
            Ok(rows) => rows,
            Err(e) => {
                self.emit_failure(aligned_time, &e).await;
                return Err(e);
            }
        };

        let mut by_asset: BTreeMap<String, OffsetRows> = BTreeMap::new();
        for row in rows {
            let offset = (aligned_time - row.aligned_time) / 60_000;
            by_asset.entry(row.asset_id.clone()).or_default().insert(offset, row);
        }

        let computed_at = Utc::now();
        let mut out_rows = Vec::new();
        let mut assets_written = 0u32;

        for (asset_id, offset_rows) in &by_asset {
            let values = match compute_all(offset_rows) {
                Ok(values) => values,
                Err(_) => {
                    self.numeric_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(aligned_time, asset_id, "numeric overflow computing indicators; asset skipped");
                    continue;
                }
            };
            if values.is_empty() {
                continue;
            }
            assets_written += 1;
            for (code, value) in values {
                let rounded = value.round_dp(INDICATOR_SCALE);
                out_rows.push(make_row(aligned_time, asset_id, code, rounded, computed_at));
            }
        }

        for chunk in out_rows.chunks(self.config.sub_batch_size) {
            if let Err(e) = self.gateway.upsert_indicators(chunk).await {
                self.emit_failure(aligned_time, &e).await;
                return Err(e);
            }
        }

        let duration_ms = self.clock.now_ms() - started_ms;
        info!(aligned_time, assets_written, indicators_written = out_rows.len(), duration_ms, "indicator bucket processed");
        self.sink
            .emit(
                Event::new(&self.config.service_name, Kind::IndicatorSuccess, Level::Info, "indicator computation completed", self.clock.now_ms())
                    .with_metric("aligned_time_ms", aligned_time as f64)
                    .with_metric("assets_written", assets_written as f64)
                    .with_metric("indicators_written", out_rows.len() as f64)
                    .with_metric("duration_ms", duration_ms as f64),
            )
            .await;

        Ok(())
    }

    async fn emit_failure(&self, aligned_time: Millis, err: &IngestError) {
        self.sink
            .emit(
                Event::new(&self.config.service_name, Kind::IndicatorFailure, Level::Error, err.to_string(), self.clock.now_ms())
                    .with_detail("aligned_time_ms", aligned_time.to_string()),
            )
            .await;
    }

    async fn history_window_with_retry(&self, aligned_time: Millis, cancel: &CancellationToken) -> Result<Vec<crate::store::HistoryRow>, IngestError> {
        let offsets = required_offsets();
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Terminal("cancelled".to_string()));
            }
            match self.gateway.history_window(aligned_time, &offsets).await {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt > self.config.retries {
                        return Err(IngestError::Terminal(crate::error::truncate_terminal_message(&e.to_string())));
                    }
                    let delay = backoff_delay(attempt, INDICATOR_BACKOFF_BASE_MS, INDICATOR_BACKOFF_FACTOR, INDICATOR_BACKOFF_CAP_MS);
                    warn!(aligned_time, attempt, delay_ms = delay.as_millis() as u64, %e, "retrying history_window");
                    self.clock.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Count of assets skipped this process lifetime due to a numeric
    /// failure (`spec.md` §4.4.4). Exposed for observability/testing.
    pub fn numeric_failure_count(&self) -> u32 {
        self.numeric_failures.load(Ordering::Relaxed)
    }
}

fn make_row(aligned_time: Millis, asset_id: &str, code: crate::types::IndicatorCode, value: rust_decimal::Decimal, computed_at: chrono::DateTime<Utc>) -> IndicatorRow {
    IndicatorRow {
        aligned_time,
        asset_id: asset_id.to_string(),
        indicator_name: code.code(),
        timeframe: code.timeframe(),
        value,
        computed_at,
    }
}

fn backoff_delay(attempt: u32, base_ms: u64, factor: u64, cap_ms: u64) -> Duration {
    let raw = base_ms.saturating_mul(factor.saturating_pow(attempt.saturating_sub(1)));
    let capped = raw.min(cap_ms);
    let jitter_span = (capped as f64 * INDICATOR_BACKOFF_JITTER) as i64;
    let jitter = if jitter_span > 0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0
    };
    Duration::from_millis((capped as i64 + jitter).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use crate::store::{HistoryRow, SnapshotRow, SyncLogRow};
    use crate::time::test_util::VirtualClock;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct FakeGateway {
        latest: Option<Millis>,
        latest_indicator: Option<Millis>,
        rows_by_bucket: Mutex<BTreeMap<Millis, Vec<HistoryRow>>>,
        written: Mutex<Vec<IndicatorRow>>,
    }

    #[async_trait]
    impl GatewayPort for FakeGateway {
        async fn upsert_snapshots(&self, _rows: &[SnapshotRow]) -> Result<(), IngestError> {
            Ok(())
        }
        async fn upsert_indicators(&self, rows: &[IndicatorRow]) -> Result<(), IngestError> {
            self.written.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
        async fn latest_bucket(&self) -> Result<Option<Millis>, IngestError> {
            Ok(self.latest)
        }
        async fn history_window(&self, aligned_time: Millis, _offsets: &[i64]) -> Result<Vec<HistoryRow>, IngestError> {
            Ok(self.rows_by_bucket.lock().unwrap().get(&aligned_time).cloned().unwrap_or_default())
        }
        async fn latest_indicator_bucket(&self) -> Result<Option<Millis>, IngestError> {
            Ok(self.latest_indicator)
        }
        async fn append_sync_log(&self, _row: &SyncLogRow) -> Result<(), IngestError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            bucket_ms: 180_000,
            page_size: 250,
            page_cap: 20,
            concurrency: 4,
            retries: 3,
            rate_limit_rps: 2.0,
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

    fn hist_row(asset_id: &str, aligned_time: Millis, price: rust_decimal::Decimal, volume: rust_decimal::Decimal) -> HistoryRow {
        HistoryRow {
            asset_id: asset_id.to_string(),
            aligned_time,
            price: Some(price),
            total_volume: Some(volume),
            market_cap: None,
        }
    }

    #[tokio::test]
    async fn processes_single_new_bucket_and_writes_indicators() {
        let t = 1_700_000_000_000i64;
        let mut rows_by_bucket = BTreeMap::new();
        rows_by_bucket.insert(
            t,
            vec![
                hist_row("btc", t, dec!(52000), dec!(1200)),
                hist_row("btc", t - 180_000, dec!(51000), dec!(1000)),
                hist_row("btc", t - 360_000, dec!(50000), dec!(900)),
                hist_row("btc", t - 86_400_000, dec!(48000), dec!(800)),
            ],
        );
        let gateway = Arc::new(FakeGateway {
            latest: Some(t),
            latest_indicator: Some(t - 180_000),
            rows_by_bucket: Mutex::new(rows_by_bucket),
            written: Mutex::new(vec![]),
        });
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new(0));
        let engine = IndicatorEngine::new(gateway.clone(), Arc::new(LogSink::new("test")), clock, test_config());

        let cancel = CancellationToken::new();
        engine.process_bucket(t, &cancel).await.unwrap();

        let written = gateway.written.lock().unwrap();
        assert!(written.iter().any(|r| r.indicator_name == "PRICE_CHANGE_3M" && r.asset_id == "btc"));
    }

    #[tokio::test]
    async fn missing_offset_skips_dependent_indicators_for_bucket() {
        let t = 1_700_000_000_000i64;
        let mut rows_by_bucket = BTreeMap::new();
        rows_by_bucket.insert(
            t,
            vec![
                hist_row("btc", t, dec!(52000), dec!(1200)),
                hist_row("btc", t - 360_000, dec!(50000), dec!(900)),
                hist_row("btc", t - 86_400_000, dec!(48000), dec!(800)),
            ],
        );
        let gateway = Arc::new(FakeGateway {
            latest: Some(t),
            latest_indicator: Some(t - 180_000),
            rows_by_bucket: Mutex::new(rows_by_bucket),
            written: Mutex::new(vec![]),
        });
        let clock: Arc<dyn Clock> = Arc::new(VirtualClock::new(0));
        let engine = IndicatorEngine::new(gateway.clone(), Arc::new(LogSink::new("test")), clock, test_config());

        engine.process_bucket(t, &CancellationToken::new()).await.unwrap();

        let written = gateway.written.lock().unwrap();
        assert!(!written.iter().any(|r| r.indicator_name == "PRICE_CHANGE_3M"));
        assert!(written.iter().any(|r| r.indicator_name == "PRICE_CHANGE_24H"));
    }
}
