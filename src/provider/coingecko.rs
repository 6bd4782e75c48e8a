//! HTTP client for the upstream paginated market-snapshot endpoint —
//! `spec.md` §6.1. Grounded on `binance::client::BinanceClient`'s
//! `reqwest::Client` construction, per-call `#[instrument]` spans, and
//! `anyhow::Context`-based error narration, adapted from signed
//! account/order endpoints to a single unsigned, paginated public GET.

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{MarketDataProvider, Page, ProviderError, RawAsset};

/// `reqwest`-backed [`MarketDataProvider`] for the configured upstream base URL.
pub struct HttpMarketDataProvider {
    base_url: String,
    api_key: String,
    quote_currency: String,
    client: reqwest::Client,
}

impl HttpMarketDataProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, quote_currency: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client for HttpMarketDataProvider");

        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            quote_currency: quote_currency.into(),
            client,
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn with_client(base_url: impl Into<String>, api_key: impl Into<String>, quote_currency: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            quote_currency: quote_currency.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    /// GET the market-snapshot page, market-cap descending, quote currency fixed.
    #[instrument(skip(self), name = "coingecko::fetch_page")]
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<Page, ProviderError> {
        let url = format!(
            "{}/coins/markets?vs_currency={}&order=market_cap_desc&per_page={}&page={}",
            self.base_url, self.quote_currency, per_page, page
        );

        let resp = self
            .client
            .get(&url)
            .header("x-cg-pro-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transient {
                source: e.into(),
                retry_after: None,
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(page, %status, "page fetch failed with retryable status");
            return Err(ProviderError::Transient {
                source: anyhow::anyhow!("upstream returned {status}"),
                retry_after,
            });
        }

        if status.is_client_error() {
            return Err(ProviderError::Terminal {
                page,
                reason: format!("upstream returned {status}"),
            });
        }

        let assets: Vec<RawAsset> = resp.json().await.map_err(|e| ProviderError::Terminal {
            page,
            reason: format!("failed to parse page {page} body: {e}"),
        })?;

        debug!(page, count = assets.len(), "page fetched");
        Ok(Page {
            assets,
            requested_per_page: per_page,
        })
    }
}
