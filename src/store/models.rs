//! Row types for the snapshot and indicator tables — `spec.md` §3, §6.2, §6.3.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{AssetId, Millis};

/// One row of the `coin_data` table: `(aligned_time, asset_id)` is the
/// primary key. Replacement is by that key — a later write for the same key
/// overwrites the body (`spec.md` §3 invariant).
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub aligned_time: Millis,
    pub asset_id: AssetId,
    pub raw_time: Millis,

    pub symbol: Option<String>,
    pub display_name: Option<String>,
    pub icon_url: Option<String>,

    pub price: Option<Decimal>,
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

    /// Server insertion time; set by the Gateway, not the caller.
    pub row_created_at: Option<DateTime<Utc>>,
}

/// Maximum byte length of `asset_id` per the declared column width
/// (`spec.md` §4.3.2: "reject a row ... if `asset_id` exceeds its width").
pub const ASSET_ID_MAX_LEN: usize = 64;
/// Maximum byte length of `symbol` / `display_name` columns.
pub const SHORT_STRING_MAX_LEN: usize = 128;
/// Maximum byte length of `icon_url`.
pub const URL_MAX_LEN: usize = 512;

/// One row of the `indicator_data` table. Primary key is
/// `(aligned_time, asset_id, indicator_name, timeframe)`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub aligned_time: Millis,
    pub asset_id: AssetId,
    pub indicator_name: &'static str,
    pub timeframe: &'static str,
    pub value: Decimal,
    pub computed_at: DateTime<Utc>,
}

/// Projection returned by `history_window`, per `spec.md` §4.2.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub asset_id: AssetId,
    pub aligned_time: Millis,
    pub price: Option<Decimal>,
    pub total_volume: Option<Decimal>,
    pub market_cap: Option<Decimal>,
}

/// One append-only row in the Sync Log (`spec.md` §3 "Sync Log").
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogRow {
    pub tick_id: uuid::Uuid,
    pub tick_started_at: DateTime<Utc>,
    pub tick_ended_at: DateTime<Utc>,
    pub pages_attempted: i32,
    pub pages_succeeded: i32,
    pub rows_written: i64,
    pub status: &'static str,
    pub first_error: Option<String>,
}
