//! Run summaries printed as JSON after each stage.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::validator::HealthFlag;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierSummary {
    pub date: Option<NaiveDate>,
    pub items: usize,
    pub assigned: usize,
    pub errored: usize,
    /// Items per numeric tier after assignment
    pub distribution: BTreeMap<i16, usize>,
}

impl TierSummary {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub date: Option<NaiveDate>,
    pub due: usize,
    pub due_by_tier: BTreeMap<i16, usize>,
    pub refreshed: usize,
    pub fetch_failed: usize,
    pub write_failed: usize,
    /// Due items left untouched because the call budget ran out
    pub skipped_budget: usize,
    pub page_calls: usize,
    pub listings_new: usize,
    pub listings_existing: usize,
    /// Fetched listings already active under a grade variant
    pub listings_elsewhere: usize,
    /// New listings inserted under a grade variant
    pub listings_routed: usize,
    /// Items that learned a catalog id from their listings
    pub catalog_backfilled: usize,
    pub listings_disappeared: usize,
    pub listings_ignored: usize,
    pub price_changes: usize,
    /// Records without an id or a usable price
    pub records_rejected: usize,
    /// Records in a foreign currency
    pub records_filtered: usize,
    /// Repeated ids within one fetch
    pub records_duplicate: usize,
}

impl RefreshSummary {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupplySummary {
    pub date: Option<NaiveDate>,
    pub listings_scanned: usize,
    pub undated_listings: usize,
    pub items: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
    pub new_listings: i64,
    pub active_listings: i64,
}

impl SupplySummary {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EstimateSummary {
    pub date: Option<NaiveDate>,
    pub model_version: String,
    pub items: usize,
    pub estimated: usize,
    pub no_estimate: usize,
    pub shocked: usize,
    pub write_failed: usize,
    /// Rows per driving factor
    pub by_factor: BTreeMap<String, usize>,
}

impl EstimateSummary {
    pub fn new(date: NaiveDate, model_version: &str) -> Self {
        Self {
            date: Some(date),
            model_version: model_version.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub date: Option<NaiveDate>,
    pub model_version: String,
    pub sales: usize,
    /// Sales with a non-positive price
    pub sales_rejected: usize,
    pub matched: usize,
    pub unmatched_sales: usize,
    pub unmatched_estimates: usize,
    pub rows_updated: usize,
    /// Matched rows whose write-back failed or found no row
    pub rows_failed: usize,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
    pub bias: Option<f64>,
    pub mape: Option<f64>,
    /// Percentage of matched pairs within the hit threshold
    pub hit_rate: Option<f64>,
    pub flags: Vec<HealthFlag>,
    pub snapshot_written: bool,
    /// Markdown model report, written to disk on request
    #[serde(skip)]
    pub report: Option<String>,
}

impl ValidationSummary {
    pub fn new(date: NaiveDate, model_version: &str) -> Self {
        Self {
            date: Some(date),
            model_version: model_version.to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of one stage inside a daily run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome<T> {
    Completed { summary: T },
    Failed { error: String },
    Skipped { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn summary(&self) -> Option<&T> {
        match self {
            StageOutcome::Completed { summary } => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub refresh: StageOutcome<RefreshSummary>,
    pub supply: StageOutcome<SupplySummary>,
    pub estimates: StageOutcome<EstimateSummary>,
    pub validation: StageOutcome<ValidationSummary>,
    /// Set when a stage failure stopped the run early
    pub aborted_at: Option<String>,
}
