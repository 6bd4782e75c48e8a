//! Core domain types shared across the ingest and indicator pipelines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque short identifier for a tracked asset (e.g. `"bitcoin"`).
pub type AssetId = String;

/// Integer milliseconds since the Unix epoch, UTC.
pub type Millis = i64;

/// Snap `t` down to the nearest multiple of `bucket_ms` (floor division).
///
/// `align(t) = (t / bucket_ms) * bucket_ms`.
#[inline]
pub fn align(t: Millis, bucket_ms: Millis) -> Millis {
    debug_assert!(bucket_ms > 0, "bucket_ms must be positive");
    t.div_euclid(bucket_ms) * bucket_ms
}

/// Terminal outcome of a single ingest tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    /// Every page succeeded and every sub-batch was committed.
    Success,
    /// At least one row committed, at least one page or sub-batch failed terminally.
    Partial,
    /// No rows committed.
    Failure,
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TickOutcome::Success => "success",
            TickOutcome::Partial => "partial",
            TickOutcome::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// The closed set of indicator codes computed by the Indicator Engine.
///
/// Fixed at build time per `spec.md` §3 ("Indicator Sample" entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorCode {
    PriceChange3m,
    PriceChange6m,
    PriceChange12m,
    PriceChange24h,
    VolumeChange1h,
    VolumeChange3h,
    VolumeChange8h,
    VolumeChange24h,
    VolumeChange3m,
    VolumeChange6m,
    VolumeChange9m,
    VolumeChangeRatio3m,
    AvgVolume3m24h,
    CapitalInflowIntensity3m,
}

impl IndicatorCode {
    /// All indicators in the fixed battery, in table order.
    pub const ALL: [IndicatorCode; 14] = [
        IndicatorCode::PriceChange3m,
        IndicatorCode::PriceChange6m,
        IndicatorCode::PriceChange12m,
        IndicatorCode::PriceChange24h,
        IndicatorCode::VolumeChange1h,
        IndicatorCode::VolumeChange3h,
        IndicatorCode::VolumeChange8h,
        IndicatorCode::VolumeChange24h,
        IndicatorCode::VolumeChange3m,
        IndicatorCode::VolumeChange6m,
        IndicatorCode::VolumeChange9m,
        IndicatorCode::VolumeChangeRatio3m,
        IndicatorCode::AvgVolume3m24h,
        IndicatorCode::CapitalInflowIntensity3m,
    ];

    /// The stable wire/storage name for this indicator, matching `spec.md`'s table.
    pub const fn code(self) -> &'static str {
        match self {
            IndicatorCode::PriceChange3m => "PRICE_CHANGE_3M",
            IndicatorCode::PriceChange6m => "PRICE_CHANGE_6M",
            IndicatorCode::PriceChange12m => "PRICE_CHANGE_12M",
            IndicatorCode::PriceChange24h => "PRICE_CHANGE_24H",
            IndicatorCode::VolumeChange1h => "VOLUME_CHANGE_1H",
            IndicatorCode::VolumeChange3h => "VOLUME_CHANGE_3H",
            IndicatorCode::VolumeChange8h => "VOLUME_CHANGE_8H",
            IndicatorCode::VolumeChange24h => "VOLUME_CHANGE_24H",
            IndicatorCode::VolumeChange3m => "VOLUME_CHANGE_3M",
            IndicatorCode::VolumeChange6m => "VOLUME_CHANGE_6M",
            IndicatorCode::VolumeChange9m => "VOLUME_CHANGE_9M",
            IndicatorCode::VolumeChangeRatio3m => "VOLUME_CHANGE_RATIO_3M",
            IndicatorCode::AvgVolume3m24h => "AVG_VOLUME_3M_24H",
            IndicatorCode::CapitalInflowIntensity3m => "CAPITAL_INFLOW_INTENSITY_3M",
        }
    }

    /// The timeframe tag stored alongside this indicator's value.
    pub const fn timeframe(self) -> &'static str {
        match self {
            IndicatorCode::PriceChange3m
            | IndicatorCode::VolumeChange3m
            | IndicatorCode::VolumeChangeRatio3m
            | IndicatorCode::CapitalInflowIntensity3m => "3m",
            IndicatorCode::PriceChange6m | IndicatorCode::VolumeChange6m => "6m",
            IndicatorCode::PriceChange12m => "12m",
            IndicatorCode::PriceChange24h
            | IndicatorCode::VolumeChange24h
            | IndicatorCode::AvgVolume3m24h => "24h",
            IndicatorCode::VolumeChange1h => "1h",
            IndicatorCode::VolumeChange3h => "3h",
            IndicatorCode::VolumeChange8h => "8h",
            IndicatorCode::VolumeChange9m => "9m",
        }
    }
}

impl fmt::Display for IndicatorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_floors_to_bucket_boundary() {
        assert_eq!(align(1_700_000_030_000, 180_000), 1_699_999_920_000);
        assert_eq!(align(0, 180_000), 0);
        assert_eq!(align(179_999, 180_000), 0);
        assert_eq!(align(180_000, 180_000), 180_000);
    }

    #[test]
    fn align_is_idempotent() {
        let t = 1_700_000_030_000;
        let once = align(t, 180_000);
        assert_eq!(align(once, 180_000), once);
    }

    #[test]
    fn indicator_code_and_timeframe_are_stable() {
        assert_eq!(IndicatorCode::PriceChange3m.code(), "PRICE_CHANGE_3M");
        assert_eq!(IndicatorCode::PriceChange3m.timeframe(), "3m");
        assert_eq!(IndicatorCode::VolumeChange24h.timeframe(), "24h");
    }
}
