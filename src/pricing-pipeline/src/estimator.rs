//! Price estimator with supply-shock handling.
//!
//! Base value comes from the active floor (cheapest live fixed-price/best-offer
//! ask) and the day's new-listing median. A burst of new supply well above the
//! trailing average discounts the estimate.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use common::models::{DailySupplyMetric, PriceEstimate, SignalStrength, StoredListing};

use crate::store::PricingStore;
use crate::summary::EstimateSummary;

pub const FACTOR_NEW_LOW: &str = "New Low";
pub const FACTOR_FLOOR: &str = "Floor";
pub const FACTOR_FLOOR_NO_NEW: &str = "Floor (No New)";
pub const FACTOR_NEW_ONLY: &str = "New Only (No Floor)";
pub const SHOCK_SUFFIX: &str = " + Shock";

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorParams {
    /// New volume above this multiple of the trailing average is a shock
    pub shock_multiplier: Decimal,
    /// Fraction taken off a shocked estimate
    pub shock_discount: Decimal,
    pub trailing_window_days: i64,
    pub model_version: String,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            shock_multiplier: dec!(1.5),
            shock_discount: dec!(0.05),
            trailing_window_days: 7,
            model_version: "v1_supply_velocity".to_string(),
        }
    }
}

/// Per-item inputs for one date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimateInputs {
    /// Cheapest active fixed-price/best-offer ask
    pub floor_price: Option<Decimal>,
    /// Median of the day's new fixed-price/best-offer listings
    pub new_median: Option<Decimal>,
    /// Count of the day's new fixed-price/best-offer listings
    pub new_volume: i64,
    /// Mean daily new volume over the trailing window
    pub trailing_volume: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub value: Decimal,
    pub driving_factor: String,
    pub signal_strength: SignalStrength,
    pub shock_multiplier: Option<Decimal>,
}

/// Value estimate for one item/date, or None when there is nothing to price.
pub fn estimate(inputs: &EstimateInputs, params: &EstimatorParams) -> Option<Estimate> {
    let floor = inputs.floor_price.filter(|p| *p > Decimal::ZERO);
    let new = inputs.new_median.filter(|p| *p > Decimal::ZERO);

    let (value, factor, strength) = match (new, floor) {
        (Some(n), Some(f)) if n < f => (n, FACTOR_NEW_LOW, SignalStrength::High),
        (Some(_), Some(f)) => (f, FACTOR_FLOOR, SignalStrength::Medium),
        (None, Some(f)) => (f, FACTOR_FLOOR_NO_NEW, SignalStrength::Medium),
        (Some(n), None) => (n, FACTOR_NEW_ONLY, SignalStrength::Low),
        (None, None) => return None,
    };

    if is_shock(inputs.new_volume, inputs.trailing_volume, params.shock_multiplier) {
        let discounted = (value * (Decimal::ONE - params.shock_discount)).round_dp(2);
        return Some(Estimate {
            value: discounted,
            driving_factor: format!("{factor}{SHOCK_SUFFIX}"),
            signal_strength: strength,
            shock_multiplier: Some(params.shock_multiplier),
        });
    }

    Some(Estimate {
        value,
        driving_factor: factor.to_string(),
        signal_strength: strength,
        shock_multiplier: None,
    })
}

/// New volume exceeds `multiplier` times a positive trailing average.
pub fn is_shock(new_volume: i64, trailing_volume: Decimal, multiplier: Decimal) -> bool {
    trailing_volume > Decimal::ZERO && Decimal::from(new_volume) > multiplier * trailing_volume
}

/// Mean daily new fixed-price/best-offer volume over the `window` days
/// before `date`. Days without a row count as zero; `date` itself is
/// excluded.
pub fn trailing_average(history: &[DailySupplyMetric], date: NaiveDate, window: i64) -> Decimal {
    if window <= 0 {
        return Decimal::ZERO;
    }
    let from = date - Duration::days(window);

    let total: i64 = history
        .iter()
        .filter(|m| m.date >= from && m.date < date)
        .map(|m| m.new_priced_count())
        .sum();

    Decimal::from(total) / Decimal::from(window)
}

/// Cheapest positive fixed-price/best-offer ask per item among active,
/// non-ignored listings.
pub fn floor_prices(listings: &[StoredListing]) -> HashMap<i64, Decimal> {
    let mut floors: HashMap<i64, Decimal> = HashMap::new();

    for listing in listings {
        let Some(item_id) = listing.item_id else {
            continue;
        };
        if !listing.is_active
            || listing.is_ignored
            || listing.price <= Decimal::ZERO
            || !listing.buying_option().is_priced()
        {
            continue;
        }

        floors
            .entry(item_id)
            .and_modify(|p| *p = (*p).min(listing.price))
            .or_insert(listing.price);
    }

    floors
}

/// Estimate and persist every item with a floor or a supply row on `date`.
pub async fn run_estimates(
    store: &dyn PricingStore,
    date: NaiveDate,
    params: &EstimatorParams,
) -> Result<EstimateSummary> {
    let floors = floor_prices(&store.active_priced_listings().await?);
    let history = store
        .supply_history(date - Duration::days(params.trailing_window_days), date)
        .await?;

    let mut history_by_item: BTreeMap<i64, Vec<DailySupplyMetric>> = BTreeMap::new();
    for metric in history {
        history_by_item.entry(metric.item_id).or_default().push(metric);
    }

    let mut candidates: BTreeSet<i64> = floors.keys().copied().collect();
    candidates.extend(
        history_by_item
            .iter()
            .filter(|(_, rows)| rows.iter().any(|r| r.date == date))
            .map(|(id, _)| *id),
    );

    let mut summary = EstimateSummary::new(date, &params.model_version);
    summary.items = candidates.len();

    for item_id in candidates {
        let rows = history_by_item.get(&item_id).map(Vec::as_slice).unwrap_or(&[]);
        let today = rows.iter().find(|r| r.date == date);

        let inputs = EstimateInputs {
            floor_price: floors.get(&item_id).copied(),
            new_median: today.and_then(|r| r.median_new_price),
            new_volume: today.map(|r| r.new_priced_count()).unwrap_or(0),
            trailing_volume: trailing_average(rows, date, params.trailing_window_days),
        };

        let Some(est) = estimate(&inputs, params) else {
            debug!("No estimate for item {} on {}", item_id, date);
            summary.no_estimate += 1;
            continue;
        };

        let row = PriceEstimate {
            item_id,
            date,
            model_version: params.model_version.clone(),
            estimated_market_value: est.value,
            driving_factor: est.driving_factor.clone(),
            signal_strength: est.signal_strength,
            shock_multiplier: est.shock_multiplier,
            actual_sold_price: None,
            error_pct: None,
        };

        match store.upsert_price_estimate(&row).await {
            Ok(()) => {
                summary.estimated += 1;
                if est.shock_multiplier.is_some() {
                    summary.shocked += 1;
                }
                *summary.by_factor.entry(est.driving_factor).or_insert(0) += 1;
            }
            Err(e) => {
                warn!("Failed to write estimate for item {}: {}", item_id, e);
                summary.write_failed += 1;
            }
        }
    }

    info!(
        "Estimates for {} ({}): {} written, {} without signal, {} shocked",
        date, params.model_version, summary.estimated, summary.no_estimate, summary.shocked
    );

    Ok(summary)
}
