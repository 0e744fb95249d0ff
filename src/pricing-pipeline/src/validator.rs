//! Validation loop: score estimates against verified sales.
//!
//! A sale is matched only to the estimate of the same item on the same date.
//! Matched rows get the sold price and error written back, and one accuracy
//! snapshot is kept per (date, model version). Nothing is tuned from the
//! results; the flags are advisory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{info, warn};

use common::models::{EstimateOutcome, ModelPerformanceSnapshot, PriceEstimate, VerifiedSale};

use crate::store::PricingStore;
use crate::summary::ValidationSummary;

/// Rows listed in the report's outlier table.
const REPORT_OUTLIERS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationParams {
    pub model_version: String,
    /// A pair within this absolute percentage error is a hit
    pub hit_threshold_pct: Decimal,
    /// Mean signed error (currency units) beyond which bias is flagged
    pub bias_warning: f64,
    /// MAPE above which the model is flagged unstable
    pub mape_warning: f64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            model_version: "v1_supply_velocity".to_string(),
            hit_threshold_pct: dec!(15),
            bias_warning: 5.0,
            mape_warning: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFlag {
    OverEstimating,
    UnderEstimating,
    Unstable,
    Stable,
}

/// One verified sale paired with the estimate for its item and date.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub item_id: i64,
    pub date: NaiveDate,
    pub predicted: Decimal,
    pub actual: Decimal,
}

impl MatchedPair {
    /// Signed error, positive when the estimate was too high.
    pub fn error(&self) -> Decimal {
        self.predicted - self.actual
    }

    pub fn abs_error(&self) -> Decimal {
        self.error().abs()
    }

    pub fn pct_error(&self) -> Decimal {
        self.abs_error() / self.actual * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub pairs: Vec<MatchedPair>,
    /// Valid sales with no estimate on their date
    pub unmatched_sales: usize,
    /// Estimates of sold items dated on a day without a sale
    pub unmatched_estimates: usize,
    /// Sales with a non-positive price
    pub rejected_sales: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub bias: f64,
    pub mape: f64,
    /// Percentage of pairs within the hit threshold
    pub hit_rate: f64,
    pub sample_count: usize,
}

/// Pair sales sold on or before `through` with same-day estimates.
pub fn match_sales(
    sales: &[VerifiedSale],
    estimates: &[PriceEstimate],
    through: NaiveDate,
) -> MatchOutcome {
    let by_key: HashMap<(i64, NaiveDate), &PriceEstimate> = estimates
        .iter()
        .filter(|e| e.date <= through)
        .map(|e| ((e.item_id, e.date), e))
        .collect();

    let mut outcome = MatchOutcome::default();
    let mut sale_keys: HashSet<(i64, NaiveDate)> = HashSet::new();
    let mut sold_items: HashSet<i64> = HashSet::new();

    for sale in sales.iter().filter(|s| s.sold_date <= through) {
        if sale.price <= Decimal::ZERO {
            outcome.rejected_sales += 1;
            continue;
        }
        sale_keys.insert((sale.item_id, sale.sold_date));
        sold_items.insert(sale.item_id);

        match by_key.get(&(sale.item_id, sale.sold_date)) {
            Some(est) => outcome.pairs.push(MatchedPair {
                item_id: sale.item_id,
                date: sale.sold_date,
                predicted: est.estimated_market_value,
                actual: sale.price,
            }),
            None => outcome.unmatched_sales += 1,
        }
    }

    outcome.unmatched_estimates = by_key
        .keys()
        .filter(|(item_id, date)| {
            sold_items.contains(item_id) && !sale_keys.contains(&(*item_id, *date))
        })
        .count();

    outcome
}

/// Aggregate accuracy of the matched pairs. None when there are none.
pub fn compute_metrics(pairs: &[MatchedPair], hit_threshold_pct: Decimal) -> Option<AccuracyMetrics> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;

    let errors: Vec<f64> = pairs
        .iter()
        .map(|p| p.error().to_f64().unwrap_or_default())
        .collect();
    let pct_errors: Vec<f64> = pairs
        .iter()
        .map(|p| p.pct_error().to_f64().unwrap_or_default())
        .collect();
    let hits = pairs
        .iter()
        .filter(|p| p.pct_error() <= hit_threshold_pct)
        .count();

    Some(AccuracyMetrics {
        rmse: (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
        mae: errors.iter().map(|e| e.abs()).sum::<f64>() / n,
        bias: errors.iter().sum::<f64>() / n,
        mape: pct_errors.iter().sum::<f64>() / n,
        hit_rate: hits as f64 / n * 100.0,
        sample_count: pairs.len(),
    })
}

/// Advisory flags for a metrics snapshot. Bias is flagged on its own;
/// stability is decided by MAPE alone, so a biased model can still be Stable.
pub fn health_flags(metrics: &AccuracyMetrics, params: &ValidationParams) -> Vec<HealthFlag> {
    let mut flags = Vec::new();

    if metrics.bias > params.bias_warning {
        flags.push(HealthFlag::OverEstimating);
    } else if metrics.bias < -params.bias_warning {
        flags.push(HealthFlag::UnderEstimating);
    }
    if metrics.mape > params.mape_warning {
        flags.push(HealthFlag::Unstable);
    } else {
        flags.push(HealthFlag::Stable);
    }

    flags
}

/// Outcome per estimate row. Several sales on one row average into one
/// actual price.
pub fn row_outcomes(pairs: &[MatchedPair], model_version: &str) -> Vec<EstimateOutcome> {
    let mut grouped: BTreeMap<(i64, NaiveDate), (Decimal, Vec<Decimal>)> = BTreeMap::new();
    for pair in pairs {
        grouped
            .entry((pair.item_id, pair.date))
            .or_insert_with(|| (pair.predicted, Vec::new()))
            .1
            .push(pair.actual);
    }

    grouped
        .into_iter()
        .map(|((item_id, date), (predicted, actuals))| {
            let total: Decimal = actuals.iter().copied().sum();
            let actual = (total / Decimal::from(actuals.len())).round_dp(2);
            let error_pct = ((predicted - actual).abs() / actual * Decimal::ONE_HUNDRED).round_dp(2);
            EstimateOutcome {
                item_id,
                date,
                model_version: model_version.to_string(),
                actual_sold_price: actual,
                error_pct,
            }
        })
        .collect()
}

/// Markdown model report: summary, flags and the largest misses.
pub fn render_report(
    date: NaiveDate,
    model_version: &str,
    metrics: &AccuracyMetrics,
    flags: &[HealthFlag],
    pairs: &[MatchedPair],
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Pricing Model Report: {date} ({model_version})\n");
    let _ = writeln!(out, "## Performance");
    let _ = writeln!(out, "- Sales validated: {}", metrics.sample_count);
    let _ = writeln!(out, "- RMSE: ${:.2}", metrics.rmse);
    let _ = writeln!(out, "- MAE: ${:.2}", metrics.mae);
    let _ = writeln!(out, "- Bias: ${:.2} (positive = overestimating)", metrics.bias);
    let _ = writeln!(out, "- MAPE: {:.1}%", metrics.mape);
    let _ = writeln!(out, "- Hit rate: {:.1}%\n", metrics.hit_rate);

    let _ = writeln!(out, "## Flags");
    for flag in flags {
        let line = match flag {
            HealthFlag::OverEstimating => "- Overestimating: estimates run consistently above sales",
            HealthFlag::UnderEstimating => "- Underestimating: estimates run consistently below sales",
            HealthFlag::Unstable => "- Unstable: mean absolute percentage error is high",
            HealthFlag::Stable => "- Stable: errors within bounds",
        };
        let _ = writeln!(out, "{line}");
    }

    let _ = writeln!(out, "\n## Largest Misses");
    let _ = writeln!(out, "| Date | Item | Actual | Predicted | Error % |");
    let _ = writeln!(out, "|---|---|---|---|---|");

    let mut ranked: Vec<&MatchedPair> = pairs.iter().collect();
    ranked.sort_by(|a, b| b.abs_error().cmp(&a.abs_error()));
    for pair in ranked.into_iter().take(REPORT_OUTLIERS) {
        let _ = writeln!(
            out,
            "| {} | {} | ${:.2} | ${:.2} | {:.1}% |",
            pair.date,
            pair.item_id,
            pair.actual,
            pair.predicted,
            pair.pct_error()
        );
    }

    out
}

/// Match, score, write back and snapshot as of `date`.
pub async fn run_validation(
    store: &dyn PricingStore,
    date: NaiveDate,
    params: &ValidationParams,
) -> Result<ValidationSummary> {
    let sales = store.verified_sales(date).await?;
    let estimates = store.price_estimates(&params.model_version, date).await?;

    let outcome = match_sales(&sales, &estimates, date);

    let mut summary = ValidationSummary::new(date, &params.model_version);
    summary.sales = sales.len();
    summary.sales_rejected = outcome.rejected_sales;
    summary.matched = outcome.pairs.len();
    summary.unmatched_sales = outcome.unmatched_sales;
    summary.unmatched_estimates = outcome.unmatched_estimates;

    let Some(metrics) = compute_metrics(&outcome.pairs, params.hit_threshold_pct) else {
        info!("No sales matched an estimate through {}; nothing to validate", date);
        return Ok(summary);
    };

    for row in row_outcomes(&outcome.pairs, &params.model_version) {
        match store.record_estimate_outcome(&row).await {
            Ok(true) => summary.rows_updated += 1,
            Ok(false) => {
                warn!("Estimate row for item {} on {} vanished", row.item_id, row.date);
                summary.rows_failed += 1;
            }
            Err(e) => {
                warn!("Failed to record outcome for item {}: {}", row.item_id, e);
                summary.rows_failed += 1;
            }
        }
    }

    let snapshot = ModelPerformanceSnapshot {
        date,
        model_version: params.model_version.clone(),
        rmse: metrics.rmse,
        mae: metrics.mae,
        bias: metrics.bias,
        mape: metrics.mape,
        hit_rate: metrics.hit_rate,
        sample_count: i32::try_from(metrics.sample_count).unwrap_or(i32::MAX),
    };
    store.upsert_model_performance(&snapshot).await?;

    let flags = health_flags(&metrics, params);
    for flag in &flags {
        if *flag != HealthFlag::Stable {
            warn!("Model {} flagged {:?}", params.model_version, flag);
        }
    }

    summary.rmse = Some(metrics.rmse);
    summary.mae = Some(metrics.mae);
    summary.bias = Some(metrics.bias);
    summary.mape = Some(metrics.mape);
    summary.hit_rate = Some(metrics.hit_rate);
    summary.report = Some(render_report(
        date,
        &params.model_version,
        &metrics,
        &flags,
        &outcome.pairs,
    ));
    summary.flags = flags;
    summary.snapshot_written = true;

    info!(
        "Validated {} sales: RMSE {:.2}, bias {:.2}, MAPE {:.1}%, hit rate {:.1}%",
        metrics.sample_count, metrics.rmse, metrics.bias, metrics.mape, metrics.hit_rate
    );

    Ok(summary)
}
