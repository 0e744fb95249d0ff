//! Tiered refresh scheduler.
//!
//! Items worth more, or with deeper non-auction supply, are resurveyed more
//! often. Tiers are derived from the latest persisted value estimate and the
//! latest active fixed-price/best-offer volume.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{info, warn};

use common::models::{InventoryItem, RefreshTier, ValueSignal};

use crate::store::PricingStore;
use crate::summary::TierSummary;

/// Value and volume cut-offs for tiers 1-3. Comparisons are strict.
#[derive(Debug, Clone, PartialEq)]
pub struct TierThresholds {
    pub value: [Decimal; 3],
    pub volume: [i64; 3],
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            value: [Decimal::new(50, 0), Decimal::new(10, 0), Decimal::new(2, 0)],
            volume: [30, 10, 3],
        }
    }
}

impl TierThresholds {
    pub fn classify_signal(&self, signal: Option<&ValueSignal>) -> RefreshTier {
        match signal {
            Some(s) => classify_tier(s.latest_value, s.latest_volume, self),
            None => RefreshTier::Tier4,
        }
    }
}

/// First matching tier wins. A missing value or volume never matches, so an
/// item with no history lands in tier 4.
pub fn classify_tier(
    value: Option<Decimal>,
    volume: Option<i64>,
    thresholds: &TierThresholds,
) -> RefreshTier {
    let tiers = [RefreshTier::Tier1, RefreshTier::Tier2, RefreshTier::Tier3];

    for (i, tier) in tiers.into_iter().enumerate() {
        let value_hit = value.is_some_and(|v| v > thresholds.value[i]);
        let volume_hit = volume.is_some_and(|n| n > thresholds.volume[i]);
        if value_hit || volume_hit {
            return tier;
        }
    }

    RefreshTier::Tier4
}

/// Index value signals by item id.
pub fn signals_by_item(signals: Vec<ValueSignal>) -> HashMap<i64, ValueSignal> {
    signals.into_iter().map(|s| (s.item_id, s)).collect()
}

/// Reclassify every item as of `today` and schedule it `today + interval`.
pub async fn assign_tiers(
    store: &dyn PricingStore,
    today: NaiveDate,
    thresholds: &TierThresholds,
    model_version: &str,
) -> Result<TierSummary> {
    let items = store.items().await?;
    let signals = signals_by_item(store.value_signals(today, model_version).await?);

    let mut summary = TierSummary::new(today);
    summary.items = items.len();

    for item in &items {
        let tier = thresholds.classify_signal(signals.get(&item.id));
        let next_due = tier.next_due(today);

        match store.update_item_schedule(item.id, tier, next_due).await {
            Ok(()) => {
                summary.assigned += 1;
                *summary.distribution.entry(tier.as_i16()).or_insert(0) += 1;
            }
            Err(e) => {
                warn!("Failed to schedule item {}: {}", item.id, e);
                summary.errored += 1;
            }
        }
    }

    info!(
        "Assigned tiers to {}/{} items: {:?}",
        summary.assigned, summary.items, summary.distribution
    );

    Ok(summary)
}

/// Items due on or before `today`: lowest tier first, then oldest due date,
/// capped at `cap`.
pub async fn select_due(
    store: &dyn PricingStore,
    today: NaiveDate,
    cap: usize,
) -> Result<Vec<InventoryItem>> {
    let mut due: Vec<InventoryItem> = store
        .due_items(today, cap)
        .await?
        .into_iter()
        .filter(|i| i.next_refresh_due <= today)
        .collect();

    due.sort_by_key(|i| (i.refresh_tier, i.next_refresh_due, i.id));
    due.truncate(cap);

    Ok(due)
}

/// Tier distribution keyed by numeric tier.
pub fn tier_distribution(items: &[InventoryItem]) -> BTreeMap<i16, usize> {
    let mut dist = BTreeMap::new();
    for item in items {
        *dist.entry(item.refresh_tier.as_i16()).or_insert(0) += 1;
    }
    dist
}
