//! Process configuration — `spec.md` §6.5.
//!
//! Loaded once at startup from environment variables (optionally pre-seeded
//! from a `.env` file via `dotenv`), in the `#[serde(default)]`-per-field
//! idiom the teacher uses in `runtime_config.rs`. Unlike that module this is
//! load-only: there is no hot-reload or atomic-save path here, since
//! `spec.md` §6.5 only requires a one-time read at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_bucket_ms() -> i64 {
    180_000
}
fn default_page_size() -> u32 {
    250
}
fn default_page_cap() -> u32 {
    20
}
fn default_concurrency() -> usize {
    4
}
fn default_retries() -> u32 {
    3
}
fn default_rate_limit_rps() -> f64 {
    2.0
}
fn default_poll_interval_s() -> u64 {
    3
}
fn default_safety_delay_s() -> u64 {
    5
}
fn default_sub_batch_size() -> usize {
    1_000
}
fn default_quote_currency() -> String {
    "usd".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_service_name() -> String {
    "reftick".to_string()
}

/// All process-level tunables, per `spec.md` §6.5. `#[serde(default = "...")]`
/// on every field means an absent environment variable never fails loading —
/// only a value present but unparsable does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bucket size in milliseconds (`Δ` in `spec.md`).
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,

    /// Assets requested per upstream page (`P`, capped at 250 upstream).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Hard stop on pagination regardless of page contents (`spec.md` §6.1).
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,

    /// Bounded page concurrency (`C`) and the database pool floor.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry attempts for a page or sub-batch (`R`).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Minimum request pacing, in requests per second.
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,

    /// Indicator Engine poll interval, in seconds.
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,

    /// Indicator Engine safety delay after a new watermark, in seconds.
    #[serde(default = "default_safety_delay_s")]
    pub safety_delay_s: u64,

    /// Upsert sub-batch size (`B`).
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Quote currency passed to the upstream provider (e.g. `usd`).
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Service name tagged on every emitted event.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    pub db_dsn: String,
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub webhook_urls: Vec<String>,
}

impl Config {
    /// Load from process environment variables, optionally pre-seeded by a
    /// `.env` file in the working directory (missing `.env` is not an
    /// error — `dotenv` itself tolerates that).
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let db_dsn = std::env::var("DB_DSN").context("DB_DSN is required")?;
        let api_base_url = std::env::var("API_BASE_URL").context("API_BASE_URL is required")?;

        let mut cfg = Config {
            bucket_ms: default_bucket_ms(),
            page_size: default_page_size(),
            page_cap: default_page_cap(),
            concurrency: default_concurrency(),
            retries: default_retries(),
            rate_limit_rps: default_rate_limit_rps(),
            poll_interval_s: default_poll_interval_s(),
            safety_delay_s: default_safety_delay_s(),
            sub_batch_size: default_sub_batch_size(),
            quote_currency: default_quote_currency(),
            log_level: default_log_level(),
            service_name: default_service_name(),
            db_dsn,
            api_base_url,
            api_key: std::env::var("API_KEY").unwrap_or_default(),
            webhook_urls: Vec::new(),
        };

        if let Some(v) = env_opt::<i64>("BUCKET_MS")? {
            cfg.bucket_ms = v;
        }
        if let Some(v) = env_opt::<u32>("PAGE_SIZE")? {
            cfg.page_size = v.min(250);
        }
        if let Some(v) = env_opt::<u32>("PAGE_CAP")? {
            cfg.page_cap = v;
        }
        if let Some(v) = env_opt::<usize>("CONCURRENCY")? {
            cfg.concurrency = v.max(1);
        }
        if let Some(v) = env_opt::<u32>("RETRIES")? {
            cfg.retries = v;
        }
        if let Some(v) = env_opt::<f64>("RATE_LIMIT_RPS")? {
            cfg.rate_limit_rps = v;
        }
        if let Some(v) = env_opt::<u64>("POLL_INTERVAL_S")? {
            cfg.poll_interval_s = v;
        }
        if let Some(v) = env_opt::<u64>("SAFETY_DELAY_S")? {
            cfg.safety_delay_s = v;
        }
        if let Some(v) = env_opt::<usize>("SUB_BATCH_SIZE")? {
            cfg.sub_batch_size = v;
        }
        if let Ok(v) = std::env::var("QUOTE_CURRENCY") {
            cfg.quote_currency = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = std::env::var("SERVICE_NAME") {
            cfg.service_name = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_URLS") {
            cfg.webhook_urls = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.bucket_ms > 0, "bucket_ms must be positive");
        anyhow::ensure!(self.page_size > 0 && self.page_size <= 250, "page_size must be in 1..=250");
        anyhow::ensure!(self.concurrency > 0, "concurrency must be at least 1");
        anyhow::ensure!(self.rate_limit_rps >= 0.0, "rate_limit_rps must not be negative");
        Ok(())
    }

    /// The `2Δ` tick deadline from `spec.md` §5.
    pub fn tick_deadline_ms(&self) -> i64 {
        self.bucket_ms * 2
    }
}

fn env_opt<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("invalid value for {key}: {e}")),
    }
}
