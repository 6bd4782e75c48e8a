//! Snapshot Store Gateway — `spec.md` §4.2, §6.2, §6.3.
//!
//! The sole typed access path to `coin_data` and `indicator_data`. All SQL
//! lives here (Design Note: "Implicit schema assumptions in SQL strings →
//! centralize all SQL in the Gateway"). Batch upserts use
//! `sqlx::QueryBuilder::push_values` with `ON CONFLICT ... DO UPDATE`, the
//! idiom shown in the pack's indexer examples
//! (`sqlx::{PgPool, QueryBuilder}`), and are chunked to respect Postgres's
//! bind-parameter limit — each chunk commits as its own atomic unit per
//! `spec.md` §4.2's batch guarantee.

use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool, QueryBuilder};

use crate::error::IngestError;
use crate::store::models::{HistoryRow, IndicatorRow, SnapshotRow, SyncLogRow};
use crate::types::Millis;

/// Postgres binds at most 65535 parameters per statement. `SnapshotRow` binds
/// ~20 columns; `IndicatorRow` binds 6. Cap chunk size well under the limit
/// for either shape.
const MAX_PARAMS_PER_STATEMENT: usize = 65_000;
const SNAPSHOT_COLUMNS: usize = 20;
const INDICATOR_COLUMNS: usize = 6;

/// What the Ingest Scheduler/Fetcher and Indicator Engine depend on. A trait
/// so unit tests substitute an in-memory fake instead of a real Postgres
/// instance (Design Note: dependency injection over process-wide singletons).
#[async_trait::async_trait]
pub trait GatewayPort: Send + Sync {
    async fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> Result<(), IngestError>;
    async fn upsert_indicators(&self, rows: &[IndicatorRow]) -> Result<(), IngestError>;
    async fn latest_bucket(&self) -> Result<Option<Millis>, IngestError>;
    async fn history_window(
        &self,
        aligned_time: Millis,
        offsets_minutes: &[i64],
    ) -> Result<Vec<HistoryRow>, IngestError>;
    async fn latest_indicator_bucket(&self) -> Result<Option<Millis>, IngestError>;
    async fn append_sync_log(&self, row: &SyncLogRow) -> Result<(), IngestError>;
}

/// Postgres-backed implementation of [`GatewayPort`].
pub struct Gateway {
    pool: PgPool,
}

impl Gateway {
    /// Connect with a bounded pool sized `max(concurrency, 4)` per
    /// `spec.md` §5, and probe the expected column lists so a drifted schema
    /// fails fast at boot rather than mid-tick.
    pub async fn connect(dsn: &str, pool_size: u32) -> Result<Self, crate::error::FatalError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(4))
            .connect(dsn)
            .await
            .map_err(|e| crate::error::FatalError::DatabaseUnavailable(e.into()))?;

        let gateway = Self { pool };
        gateway
            .probe_schema()
            .await
            .map_err(|e| crate::error::FatalError::DatabaseUnavailable(e.into()))?;
        Ok(gateway)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `SELECT ... LIMIT 0` against both tables: fails at boot if the
    /// expected columns are missing, instead of surfacing as a mysterious
    /// runtime error mid-tick.
    async fn probe_schema(&self) -> sqlx::Result<()> {
        sqlx::query(
            "SELECT aligned_time, asset_id, raw_time, symbol, display_name, icon_url, \
             price, market_cap, market_cap_rank, fully_diluted_valuation, total_volume, \
             circulating_supply, max_supply, ath, ath_date, atl, atl_date, \
             price_change_percentage_24h, market_cap_change_24h, \
             market_cap_change_percentage_24h, row_created_at \
             FROM coin_data LIMIT 0",
        )
        .fetch_all(&self.pool)
        .await?;

        sqlx::query(
            "SELECT aligned_time, asset_id, indicator_name, timeframe, value, computed_at \
             FROM indicator_data LIMIT 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(())
    }

    fn chunk_size(columns: usize) -> usize {
        (MAX_PARAMS_PER_STATEMENT / columns).max(1)
    }
}

fn classify(err: sqlx::Error) -> IngestError {
    match &err {
        sqlx::Error::Database(db_err) => {
            // Constraint / check violations are permanent; anything else
            // (connection reset, pool timeout) is treated as transient.
            if db_err.is_check_violation() || db_err.is_foreign_key_violation() {
                IngestError::Permanent {
                    unit: "row".to_string(),
                    reason: db_err.message().to_string(),
                }
            } else {
                IngestError::Transient(err.into())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => IngestError::Transient(err.into()),
        _ => IngestError::Transient(err.into()),
    }
}

#[async_trait::async_trait]
impl GatewayPort for Gateway {
    async fn upsert_snapshots(&self, rows: &[SnapshotRow]) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }
        let aligned_time = rows[0].aligned_time;
        debug_assert!(
            rows.iter().all(|r| r.aligned_time == aligned_time),
            "all rows in one upsert_snapshots call must share one aligned_time"
        );

        for chunk in rows.chunks(Self::chunk_size(SNAPSHOT_COLUMNS)) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO coin_data (aligned_time, asset_id, raw_time, symbol, \
                 display_name, icon_url, price, market_cap, market_cap_rank, \
                 fully_diluted_valuation, total_volume, circulating_supply, max_supply, \
                 ath, ath_date, atl, atl_date, price_change_percentage_24h, \
                 market_cap_change_24h, market_cap_change_percentage_24h, row_created_at) ",
            );
            let now = Utc::now();
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.aligned_time)
                    .push_bind(&row.asset_id)
                    .push_bind(row.raw_time)
                    .push_bind(&row.symbol)
                    .push_bind(&row.display_name)
                    .push_bind(&row.icon_url)
                    .push_bind(row.price)
                    .push_bind(row.market_cap)
                    .push_bind(row.market_cap_rank)
                    .push_bind(row.fully_diluted_valuation)
                    .push_bind(row.total_volume)
                    .push_bind(row.circulating_supply)
                    .push_bind(row.max_supply)
                    .push_bind(row.ath)
                    .push_bind(row.ath_date)
                    .push_bind(row.atl)
                    .push_bind(row.atl_date)
                    .push_bind(row.price_change_percentage_24h)
                    .push_bind(row.market_cap_change_24h)
                    .push_bind(row.market_cap_change_percentage_24h)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT (aligned_time, asset_id) DO UPDATE SET \
                 raw_time = EXCLUDED.raw_time, symbol = EXCLUDED.symbol, \
                 display_name = EXCLUDED.display_name, icon_url = EXCLUDED.icon_url, \
                 price = EXCLUDED.price, market_cap = EXCLUDED.market_cap, \
                 market_cap_rank = EXCLUDED.market_cap_rank, \
                 fully_diluted_valuation = EXCLUDED.fully_diluted_valuation, \
                 total_volume = EXCLUDED.total_volume, \
                 circulating_supply = EXCLUDED.circulating_supply, \
                 max_supply = EXCLUDED.max_supply, ath = EXCLUDED.ath, \
                 ath_date = EXCLUDED.ath_date, atl = EXCLUDED.atl, atl_date = EXCLUDED.atl_date, \
                 price_change_percentage_24h = EXCLUDED.price_change_percentage_24h, \
                 market_cap_change_24h = EXCLUDED.market_cap_change_24h, \
                 market_cap_change_percentage_24h = EXCLUDED.market_cap_change_percentage_24h",
            );

            qb.build()
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn upsert_indicators(&self, rows: &[IndicatorRow]) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }
        for chunk in rows.chunks(Self::chunk_size(INDICATOR_COLUMNS)) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO indicator_data (aligned_time, asset_id, indicator_name, \
                 timeframe, value, computed_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.aligned_time)
                    .push_bind(&row.asset_id)
                    .push_bind(row.indicator_name)
                    .push_bind(row.timeframe)
                    .push_bind(row.value)
                    .push_bind(row.computed_at);
            });
            qb.push(
                " ON CONFLICT (aligned_time, asset_id, indicator_name, timeframe) \
                 DO UPDATE SET value = EXCLUDED.value, computed_at = EXCLUDED.computed_at",
            );

            qb.build()
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }

    async fn latest_bucket(&self) -> Result<Option<Millis>, IngestError> {
        sqlx::query_scalar::<_, Option<Millis>>("SELECT MAX(aligned_time) FROM coin_data")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    async fn latest_indicator_bucket(&self) -> Result<Option<Millis>, IngestError> {
        sqlx::query_scalar::<_, Option<Millis>>("SELECT MAX(aligned_time) FROM indicator_data")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    async fn history_window(
        &self,
        aligned_time: Millis,
        offsets_minutes: &[i64],
    ) -> Result<Vec<HistoryRow>, IngestError> {
        let targets: Vec<Millis> = offsets_minutes
            .iter()
            .map(|off| aligned_time - off * 60_000)
            .collect();

        let rows = sqlx::query_as::<_, (String, Millis, Option<rust_decimal::Decimal>, Option<rust_decimal::Decimal>, Option<rust_decimal::Decimal>)>(
            "SELECT asset_id, aligned_time, price, total_volume, market_cap \
             FROM coin_data WHERE aligned_time = ANY($1)",
        )
        .bind(&targets)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(asset_id, aligned_time, price, total_volume, market_cap)| HistoryRow {
                asset_id,
                aligned_time,
                price,
                total_volume,
                market_cap,
            })
            .collect())
    }

    async fn append_sync_log(&self, row: &SyncLogRow) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO sync_log (tick_id, tick_started_at, tick_ended_at, pages_attempted, \
             pages_succeeded, rows_written, status, first_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.tick_id)
        .bind(row.tick_started_at)
        .bind(row.tick_ended_at)
        .bind(row.pages_attempted)
        .bind(row.pages_succeeded)
        .bind(row.rows_written)
        .bind(row.status)
        .bind(&row.first_error)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_respects_param_cap() {
        let size = Gateway::chunk_size(SNAPSHOT_COLUMNS);
        assert!(size * SNAPSHOT_COLUMNS <= MAX_PARAMS_PER_STATEMENT);
        assert!(size > 0);
    }
}
