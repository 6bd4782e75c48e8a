use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reftick::app_state::AppState;
use reftick::config::Config;
use reftick::error::FatalError;
use reftick::ingest::{Fetcher, Scheduler};
use reftick::indicator::IndicatorEngine;
use reftick::provider::coingecko::HttpMarketDataProvider;
use reftick::provider::rate_limit::RateLimiter;
use reftick::provider::MarketDataProvider;
use reftick::sink::webhook::channels_from_urls;
use reftick::sink::{CompositeSink, LogSink};
use reftick::store::Gateway;
use reftick::time::{Clock, SystemClock};

/// Pages are rate-limited *within* the fetcher by wrapping the HTTP provider
/// in a pacing decorator, so the fetcher's bounded concurrency never exceeds
/// the configured requests-per-second regardless of `concurrency`.
struct RateLimitedProvider {
    inner: HttpMarketDataProvider,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

#[async_trait::async_trait]
impl MarketDataProvider for RateLimitedProvider {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<reftick::provider::Page, reftick::provider::ProviderError> {
        self.limiter.acquire(self.clock.as_ref()).await;
        self.inner.fetch_page(page, per_page).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "fatal error at startup");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), FatalError> {
    let config = Config::load().map_err(FatalError::Config)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(service = %config.service_name, "reftick starting up");

    let gateway = Gateway::connect(&config.db_dsn, config.concurrency as u32).await?;
    let gateway: Arc<dyn reftick::store::GatewayPort> = Arc::new(gateway);

    let channels = channels_from_urls(&config.webhook_urls);
    let mut all_channels: Vec<Box<dyn reftick::sink::EventSink>> = vec![Box::new(LogSink::new("reftick"))];
    all_channels.extend(channels);
    let sink: Arc<dyn reftick::sink::EventSink> = Arc::new(CompositeSink::new(all_channels));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let provider: Arc<dyn MarketDataProvider> = Arc::new(RateLimitedProvider {
        inner: HttpMarketDataProvider::new(config.api_base_url.clone(), config.api_key.clone(), config.quote_currency.clone()),
        limiter: RateLimiter::new(config.rate_limit_rps),
        clock: clock.clone(),
    });

    let state = AppState::new(gateway.clone(), provider.clone(), sink.clone(), clock.clone(), config.clone());

    let fetcher = Arc::new(Fetcher::new(state.provider.clone(), state.gateway.clone(), state.sink.clone(), state.clock.clone(), state.config.clone()));
    let scheduler = Arc::new(Scheduler::new(fetcher, state.sink.clone(), state.clock.clone(), state.config.clone()));
    let indicator_engine = Arc::new(IndicatorEngine::new(state.gateway.clone(), state.sink.clone(), state.clock.clone(), state.config.clone()));

    let cancel = tokio_util::sync::CancellationToken::new();

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };
    let indicator_task = {
        let indicator_engine = indicator_engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { indicator_engine.run(cancel).await })
    };

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");

    cancel.cancel();
    let _ = scheduler_task.await;
    let _ = indicator_task.await;

    info!("reftick shut down cleanly");
    Ok(())
}
