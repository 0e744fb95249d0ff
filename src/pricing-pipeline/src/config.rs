//! Pricing pipeline configuration.

use std::time::Duration;

use crate::estimator::EstimatorParams;
use crate::scheduler::TierThresholds;
use crate::validator::ValidationParams;

/// Pricing pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum due items selected per refresh pass
    pub max_items_per_pass: usize,
    /// Maximum provider page requests per refresh pass
    pub max_calls_per_pass: usize,
    /// Pause between consecutive item fetches
    pub inter_item_delay: Duration,
    /// Upper bound on one item's fetch, all pages included
    pub fetch_timeout: Duration,
    /// Maximum pages followed for one item
    pub max_pages_per_item: u32,
    /// Records requested per page
    pub page_size: u32,
    /// Only listings priced in this currency are kept
    pub currency: String,
    pub tiers: TierThresholds,
    pub estimator: EstimatorParams,
    pub validation: ValidationParams,
}

impl PipelineConfig {
    /// Model version whose estimates drive tiering and validation.
    pub fn model_version(&self) -> &str {
        &self.estimator.model_version
    }

    /// Point estimation and validation at another model version.
    pub fn set_model_version(&mut self, model_version: &str) {
        self.estimator.model_version = model_version.to_string();
        self.validation.model_version = model_version.to_string();
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_items_per_pass: 500,
            max_calls_per_pass: 500,
            inter_item_delay: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            max_pages_per_item: 5,
            page_size: 200,
            currency: "USD".to_string(),
            tiers: TierThresholds::default(),
            estimator: EstimatorParams::default(),
            validation: ValidationParams::default(),
        }
    }
}
