//! Dependency-injection container — `spec.md` §9 Design Note
//! ("Process-wide mutable singletons ... replace with explicit dependency
//! injection: a Gateway value and an HTTP client value are constructed once
//! in `main` and passed to each component").
//!
//! Grounded on the shape of the teacher's `AppState` (one struct, `Arc`-held
//! subsystem handles, built once at startup) but carrying only the four
//! ports this system's components depend on — no mutable shared state, no
//! dashboard snapshot, no version counter. Cross-component communication is
//! exclusively through the snapshot table (`spec.md` §5), not through this
//! struct.

use std::sync::Arc;

use crate::config::Config;
use crate::provider::MarketDataProvider;
use crate::sink::EventSink;
use crate::store::GatewayPort;
use crate::time::Clock;

/// The constructed set of dependencies injected into the Scheduler, Fetcher,
/// and Indicator Engine. Built once in `main`; never a global/static.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn GatewayPort>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

impl AppState {
    pub fn new(gateway: Arc<dyn GatewayPort>, provider: Arc<dyn MarketDataProvider>, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, config: Config) -> Self {
        Self {
            gateway,
            provider,
            sink,
            clock,
            config,
        }
    }
}
