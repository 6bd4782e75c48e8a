//! Row normalization — `spec.md` §4.3.2 step 3.

use tracing::warn;

use crate::provider::RawAsset;
use crate::store::models::{SnapshotRow, ASSET_ID_MAX_LEN, SHORT_STRING_MAX_LEN, URL_MAX_LEN};
use crate::types::Millis;

/// Turn one upstream asset into a [`SnapshotRow`], or `None` if it must be
/// rejected (and warned about) per `spec.md` §4.3.2.
pub fn normalize(raw: RawAsset, aligned_time: Millis, raw_time: Millis) -> Option<SnapshotRow> {
    let asset_id = match raw.id {
        Some(id) if !id.is_empty() => id,
        _ => {
            warn!("skipping row with missing or empty asset id");
            return None;
        }
    };

    if asset_id.len() > ASSET_ID_MAX_LEN {
        warn!(asset_id, len = asset_id.len(), "skipping row: asset_id exceeds column width");
        return None;
    }

    let symbol = truncate_warn("symbol", &asset_id, raw.symbol, SHORT_STRING_MAX_LEN);
    let display_name = truncate_warn("display_name", &asset_id, raw.name, SHORT_STRING_MAX_LEN);
    let icon_url = truncate_warn("icon_url", &asset_id, raw.image, URL_MAX_LEN);

    Some(SnapshotRow {
        aligned_time,
        asset_id,
        raw_time,
        symbol,
        display_name,
        icon_url,
        price: raw.current_price,
        market_cap: raw.market_cap,
        market_cap_rank: raw.market_cap_rank,
        fully_diluted_valuation: raw.fully_diluted_valuation,
        total_volume: raw.total_volume,
        circulating_supply: raw.circulating_supply,
        max_supply: raw.max_supply,
        ath: raw.ath,
        ath_date: raw.ath_date,
        atl: raw.atl,
        atl_date: raw.atl_date,
        price_change_percentage_24h: raw.price_change_percentage_24h,
        market_cap_change_24h: raw.market_cap_change_24h,
        market_cap_change_percentage_24h: raw.market_cap_change_percentage_24h,
        row_created_at: None,
    })
}

/// Truncate an optional string field to `max_len` bytes, warning once if it
/// was too long. Unlike `asset_id`, other string fields are truncated rather
/// than causing the whole row to be rejected — `spec.md` §4.3.2 only
/// requires rejection for `asset_id`.
fn truncate_warn(field: &str, asset_id: &str, value: Option<String>, max_len: usize) -> Option<String> {
    value.map(|mut s| {
        if s.len() > max_len {
            warn!(asset_id, field, len = s.len(), max_len, "truncating oversized field");
            let mut end = max_len;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            s.truncate(end);
        }
        s
    })
}
