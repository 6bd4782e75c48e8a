//! Pure indicator math — `spec.md` §4.4.2.
//!
//! Every function here is a pure function of a small set of historical rows;
//! none of them touch the database or clock, which is what makes the
//! round-trip law L2/L3 in `spec.md` §8 provable by unit test alone. A `None`
//! return means "omit this indicator for this asset" (zero denominator or
//! missing input) — never a stored zero or null. A [`NumericOverflow`] is a
//! distinct, harder failure (`spec.md` §4.4.4): it aborts the whole asset
//! rather than just the one indicator, since the engine cannot trust any
//! further arithmetic against rows that already overflowed `Decimal`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::store::HistoryRow;
use crate::types::IndicatorCode;

/// One asset's rows, keyed by the `offsets_minutes` entry they were read at.
/// `BTreeMap` keeps iteration order deterministic for `AVG_VOLUME_3M_24H`'s
/// summation, matching L2's "row order must not affect the result."
pub type OffsetRows = BTreeMap<i64, HistoryRow>;

/// A `Decimal` operation overflowed its representable range. Distinct from
/// the `None` "omitted" case: this asset's bucket is skipped entirely and
/// counted, per `spec.md` §4.4.4, rather than having one indicator quietly
/// missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericOverflow;

/// The 3-minute steps summed by `AVG_VOLUME_3M_24H`: every multiple of 3
/// minutes from 0 to 1440 inclusive.
pub fn avg_volume_offsets() -> Vec<i64> {
    (0..=480).map(|k| k * 3).collect()
}

/// The fixed offset set the engine reads once per bucket via
/// `history_window`, per `spec.md` §4.4.2. A superset of
/// [`avg_volume_offsets`] so everything needed for the whole battery comes
/// back in one read.
pub fn required_offsets() -> Vec<i64> {
    let mut offsets = avg_volume_offsets();
    for extra in [0, 3, 6, 9, 12, 60, 180, 480, 1440] {
        if !offsets.contains(&extra) {
            offsets.push(extra);
        }
    }
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

fn price_at(rows: &OffsetRows, offset: i64) -> Option<Decimal> {
    rows.get(&offset).and_then(|r| r.price)
}

fn volume_at(rows: &OffsetRows, offset: i64) -> Option<Decimal> {
    rows.get(&offset).and_then(|r| r.total_volume)
}

fn pct_change(current: Decimal, prior: Decimal) -> Result<Option<Decimal>, NumericOverflow> {
    if prior.is_zero() {
        return Ok(None);
    }
    let diff = current.checked_sub(prior).ok_or(NumericOverflow)?;
    let ratio = diff.checked_div(prior).ok_or(NumericOverflow)?;
    Ok(Some(ratio))
}

/// Compute one indicator for one asset's row set. `Ok(None)` means any
/// required input is missing or a denominator is zero; `Err(NumericOverflow)`
/// means the arithmetic itself overflowed `Decimal`'s range.
pub fn compute_one(code: IndicatorCode, rows: &OffsetRows) -> Result<Option<Decimal>, NumericOverflow> {
    match code {
        IndicatorCode::PriceChange3m => match (price_at(rows, 0), price_at(rows, 3)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::PriceChange6m => match (price_at(rows, 0), price_at(rows, 6)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::PriceChange12m => match (price_at(rows, 0), price_at(rows, 12)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::PriceChange24h => match (price_at(rows, 0), price_at(rows, 1440)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },

        IndicatorCode::VolumeChange1h => match (volume_at(rows, 0), volume_at(rows, 60)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange3h => match (volume_at(rows, 0), volume_at(rows, 180)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange8h => match (volume_at(rows, 0), volume_at(rows, 480)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange24h => match (volume_at(rows, 0), volume_at(rows, 1440)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange3m => match (volume_at(rows, 0), volume_at(rows, 3)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange6m => match (volume_at(rows, 0), volume_at(rows, 6)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },
        IndicatorCode::VolumeChange9m => match (volume_at(rows, 0), volume_at(rows, 9)) {
            (Some(c), Some(p)) => pct_change(c, p),
            _ => Ok(None),
        },

        IndicatorCode::VolumeChangeRatio3m => {
            let (Some(v0), Some(v3), Some(v1440)) = (volume_at(rows, 0), volume_at(rows, 3), volume_at(rows, 1440)) else {
                return Ok(None);
            };
            if v1440.is_zero() {
                return Ok(None);
            }
            let diff = v0.checked_sub(v3).ok_or(NumericOverflow)?;
            let ratio = diff.checked_div(v1440).ok_or(NumericOverflow)?;
            Ok(Some(ratio))
        }

        IndicatorCode::AvgVolume3m24h => {
            let mut sum = Decimal::ZERO;
            let mut count: u32 = 0;
            for offset in avg_volume_offsets() {
                if let Some(v) = volume_at(rows, offset) {
                    sum = sum.checked_add(v).ok_or(NumericOverflow)?;
                    count += 1;
                }
            }
            if count == 0 {
                return Ok(None);
            }
            let avg = sum.checked_div(Decimal::from(count)).ok_or(NumericOverflow)?;
            Ok(Some(avg))
        }

        IndicatorCode::CapitalInflowIntensity3m => {
            let (Some(p0), Some(p3), Some(v0)) = (price_at(rows, 0), price_at(rows, 3), volume_at(rows, 0)) else {
                return Ok(None);
            };
            let Some(change) = pct_change(p0, p3)? else {
                return Ok(None);
            };
            let product = change.checked_mul(v0).ok_or(NumericOverflow)?;
            Ok(Some(product))
        }
    }
}

/// Compute every indicator in the fixed battery for one asset, skipping (not
/// zero-filling) any that are undefined for this row set. Aborts the whole
/// asset on the first [`NumericOverflow`] — the engine counts this as one
/// numeric failure and moves on to the next asset.
pub fn compute_all(rows: &OffsetRows) -> Result<Vec<(IndicatorCode, Decimal)>, NumericOverflow> {
    let mut out = Vec::new();
    for &code in IndicatorCode::ALL.iter() {
        if let Some(value) = compute_one(code, rows)? {
            out.push((code, value));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(asset_id: &str, aligned_time: i64, price: Decimal, volume: Decimal) -> HistoryRow {
        HistoryRow {
            asset_id: asset_id.to_string(),
            aligned_time,
            price: Some(price),
            total_volume: Some(volume),
            market_cap: None,
        }
    }

    fn btc_rows() -> OffsetRows {
        let mut rows = BTreeMap::new();
        rows.insert(0, row("btc", 0, dec!(52000), dec!(1200)));
        rows.insert(3, row("btc", -3, dec!(51000), dec!(1000)));
        rows.insert(6, row("btc", -6, dec!(50000), dec!(900)));
        rows.insert(1440, row("btc", -1440, dec!(48000), dec!(800)));
        rows
    }

    #[test]
    fn price_change_3m_matches_scenario_4() {
        let got = compute_one(IndicatorCode::PriceChange3m, &btc_rows()).unwrap().unwrap();
        let expected = (dec!(52000) - dec!(51000)) / dec!(51000);
        assert_eq!(got, expected);
    }

    #[test]
    fn price_change_24h_matches_scenario_4() {
        let got = compute_one(IndicatorCode::PriceChange24h, &btc_rows()).unwrap().unwrap();
        let expected = (dec!(52000) - dec!(48000)) / dec!(48000);
        assert_eq!(got, expected);
    }

    #[test]
    fn volume_change_3m_matches_scenario_4() {
        let got = compute_one(IndicatorCode::VolumeChange3m, &btc_rows()).unwrap().unwrap();
        assert_eq!(got, dec!(0.2));
    }

    #[test]
    fn capital_inflow_intensity_matches_scenario_4() {
        let got = compute_one(IndicatorCode::CapitalInflowIntensity3m, &btc_rows()).unwrap().unwrap();
        let change = (dec!(52000) - dec!(51000)) / dec!(51000);
        let expected = change * dec!(1200);
        assert_eq!(got, expected);
    }

    #[test]
    fn missing_offset_omits_dependent_indicators_only() {
        let mut rows = btc_rows();
        rows.remove(&3);

        assert!(compute_one(IndicatorCode::PriceChange3m, &rows).unwrap().is_none());
        assert!(compute_one(IndicatorCode::VolumeChange3m, &rows).unwrap().is_none());
        assert!(compute_one(IndicatorCode::VolumeChangeRatio3m, &rows).unwrap().is_none());
        assert!(compute_one(IndicatorCode::CapitalInflowIntensity3m, &rows).unwrap().is_none());
        // Unaffected indicators still compute (scenario 5).
        assert!(compute_one(IndicatorCode::PriceChange6m, &rows).unwrap().is_some());
        assert!(compute_one(IndicatorCode::PriceChange24h, &rows).unwrap().is_some());
    }

    #[test]
    fn zero_denominator_is_omitted_not_zero() {
        let mut rows = BTreeMap::new();
        rows.insert(0, row("x", 0, dec!(100), dec!(10)));
        rows.insert(3, row("x", -3, dec!(0), dec!(0)));
        assert!(compute_one(IndicatorCode::PriceChange3m, &rows).unwrap().is_none());
        assert!(compute_one(IndicatorCode::VolumeChange3m, &rows).unwrap().is_none());
    }

    #[test]
    fn row_order_does_not_affect_result() {
        let rows_a = btc_rows();
        let mut rows_b = BTreeMap::new();
        for (k, v) in rows_a.iter().rev() {
            rows_b.insert(*k, v.clone());
        }
        assert_eq!(compute_all(&rows_a).unwrap(), compute_all(&rows_b).unwrap());
    }

    #[test]
    fn avg_volume_24h_averages_present_steps_only() {
        let mut rows = BTreeMap::new();
        rows.insert(0, row("x", 0, dec!(1), dec!(10)));
        rows.insert(3, row("x", -3, dec!(1), dec!(20)));
        let got = compute_one(IndicatorCode::AvgVolume3m24h, &rows).unwrap().unwrap();
        assert_eq!(got, dec!(15));
    }

    #[test]
    fn overflowing_price_change_is_a_distinct_error_not_none() {
        let mut rows = BTreeMap::new();
        rows.insert(0, row("x", 0, Decimal::MAX, dec!(1)));
        rows.insert(3, row("x", -3, dec!(1), dec!(1)));
        assert_eq!(compute_one(IndicatorCode::PriceChange3m, &rows), Err(NumericOverflow));
    }

    #[test]
    fn compute_all_aborts_asset_on_first_overflow() {
        let mut rows = BTreeMap::new();
        rows.insert(0, row("x", 0, Decimal::MAX, dec!(1)));
        rows.insert(3, row("x", -3, dec!(1), dec!(1)));
        rows.insert(1440, row("x", -1440, dec!(1), dec!(1)));
        assert_eq!(compute_all(&rows), Err(NumericOverflow));
    }
}
