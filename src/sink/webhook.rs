//! Outbound HTTP webhook channel — `spec.md` §6.4.
//!
//! One POST per emitted event per configured URL. Any transport error is
//! logged and swallowed per §4.1's failure semantics; the response body is
//! discarded. Mirrors the `reqwest`-based request idiom in
//! `binance::client::BinanceClient`, simplified to a fire-and-forget POST
//! with no signing and no response parsing.

use tracing::warn;

use super::{Event, EventSink};

/// A single outbound webhook destination.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for WebhookChannel"),
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { url: url.into(), client }
    }
}

#[async_trait::async_trait]
impl EventSink for WebhookChannel {
    async fn emit(&self, event: Event) {
        let result = self.client.post(&self.url).json(&event).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(url = %self.url, status = %resp.status(), "webhook delivery returned non-2xx");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(url = %self.url, error = %err, "webhook delivery failed");
            }
        }
    }
}

/// Build one [`WebhookChannel`] per configured URL.
pub fn channels_from_urls(urls: &[String]) -> Vec<Box<dyn EventSink>> {
    urls.iter()
        .map(|url| Box::new(WebhookChannel::new(url.clone())) as Box<dyn EventSink>)
        .collect()
}
