//! Daily orchestration: refresh, supply, estimates, validation.
//!
//! Stages share nothing in memory; each reads what the previous one
//! persisted. A stage that downstream strictly depends on stops the run when
//! it fails or produces nothing.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::estimator::run_estimates;
use crate::provider::ListingsProvider;
use crate::reconciler::refresh_due_items;
use crate::store::PricingStore;
use crate::summary::{DailySummary, StageOutcome};
use crate::supply::run_supply;
use crate::validator::run_validation;

fn skipped<T>(reason: &str) -> StageOutcome<T> {
    StageOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn failed<T>(stage: &str, err: anyhow::Error) -> StageOutcome<T> {
    error!("{} stage failed: {:#}", stage, err);
    StageOutcome::Failed {
        error: format!("{err:#}"),
    }
}

/// Run every stage for `date`. Listing refresh is skipped when no provider
/// is available; a failed refresh does not stop the run.
pub async fn run_daily(
    store: &dyn PricingStore,
    provider: Option<&dyn ListingsProvider>,
    config: &PipelineConfig,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> DailySummary {
    info!("Daily pricing run for {}", date);

    let refresh = match provider {
        Some(provider) => match refresh_due_items(store, provider, config, date, now).await {
            Ok(summary) => StageOutcome::Completed { summary },
            Err(e) => failed("refresh", e),
        },
        None => {
            warn!("No listings provider configured; using stored listings");
            skipped("no listings provider configured")
        }
    };

    let mut daily = DailySummary {
        date,
        refresh,
        supply: skipped("not reached"),
        estimates: skipped("not reached"),
        validation: skipped("not reached"),
        aborted_at: None,
    };

    daily.supply = match run_supply(store, date).await {
        Ok(summary) => StageOutcome::Completed { summary },
        Err(e) => failed("supply", e),
    };
    match daily.supply.summary() {
        Some(s) if s.rows_written > 0 => {}
        Some(_) => {
            warn!("No supply rows for {}; skipping estimates and validation", date);
            daily.estimates = skipped("no supply rows");
            daily.validation = skipped("no supply rows");
            daily.aborted_at = Some("supply".to_string());
            return daily;
        }
        None => {
            daily.aborted_at = Some("supply".to_string());
            return daily;
        }
    }

    daily.estimates = match run_estimates(store, date, &config.estimator).await {
        Ok(summary) => StageOutcome::Completed { summary },
        Err(e) => failed("estimate", e),
    };
    match daily.estimates.summary() {
        Some(s) if s.estimated > 0 => {}
        Some(_) => {
            warn!("No estimates for {}; skipping validation", date);
            daily.validation = skipped("no estimates");
            daily.aborted_at = Some("estimates".to_string());
            return daily;
        }
        None => {
            daily.aborted_at = Some("estimates".to_string());
            return daily;
        }
    }

    daily.validation = match run_validation(store, date, &config.validation).await {
        Ok(summary) => StageOutcome::Completed { summary },
        Err(e) => failed("validation", e),
    };

    info!("Daily pricing run for {} complete", date);
    daily
}

impl DailySummary {
    /// Any stage failed outright.
    pub fn has_failures(&self) -> bool {
        matches!(self.refresh, StageOutcome::Failed { .. })
            || matches!(self.supply, StageOutcome::Failed { .. })
            || matches!(self.estimates, StageOutcome::Failed { .. })
            || matches!(self.validation, StageOutcome::Failed { .. })
    }
}
