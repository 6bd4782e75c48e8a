//! Upstream market-data provider — `spec.md` §4.3.2, §6.1.

pub mod coingecko;
pub mod rate_limit;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// One element of the upstream provider's paginated market-snapshot array,
/// deserialized directly from its JSON shape (`spec.md` §6.1). Unknown
/// fields are ignored by default (serde's normal behavior); missing
/// numerics deserialize to `None` rather than failing the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAsset {
    pub id: Option<String>,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub current_price: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub market_cap_rank: Option<i32>,
    pub fully_diluted_valuation: Option<Decimal>,
    pub total_volume: Option<Decimal>,
    pub circulating_supply: Option<Decimal>,
    pub max_supply: Option<Decimal>,
    pub ath: Option<Decimal>,
    pub ath_date: Option<DateTime<Utc>>,
    pub atl: Option<Decimal>,
    pub atl_date: Option<DateTime<Utc>>,
    pub price_change_percentage_24h: Option<Decimal>,
    pub market_cap_change_24h: Option<Decimal>,
    pub market_cap_change_percentage_24h: Option<Decimal>,
}

/// A single page's outcome: the caller distinguishes "fewer than `per_page`
/// items" (pagination stop condition, `spec.md` §6.1) from a genuine error.
#[derive(Debug)]
pub struct Page {
    pub assets: Vec<RawAsset>,
    pub requested_per_page: u32,
}

impl Page {
    /// True when this page signals the end of the catalog (short page).
    pub fn is_last(&self) -> bool {
        self.assets.len() < self.requested_per_page as usize
    }
}

/// A single page fetch's failure, distinguishing retryable transport/server
/// errors (with an optional server-suggested delay, from `Retry-After`) from
/// terminal-for-this-page client errors (`spec.md` §4.3.2).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {source}")]
    Transient {
        #[source]
        source: anyhow::Error,
        retry_after: Option<Duration>,
    },
    #[error("terminal provider error for page {page}: {reason}")]
    Terminal { page: u32, reason: String },
}

/// What the Fetcher depends on to retrieve one page of the asset catalog.
/// A trait so fetcher tests substitute a canned in-memory provider instead
/// of a real HTTP endpoint (Design Note: dependency injection).
#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<Page, ProviderError>;
}
