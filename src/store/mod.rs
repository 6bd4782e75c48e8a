//! Typed access layer over the snapshot and indicator tables — `spec.md` §4.2.

pub mod gateway;
pub mod models;

pub use gateway::{Gateway, GatewayPort};
pub use models::{HistoryRow, IndicatorRow, SnapshotRow, SyncLogRow};
