//! In-memory store and fixtures for stage tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

use common::models::{
    DailySupplyMetric, EstimateOutcome, InventoryItem, ListingChangeSet, ListingPriceChange,
    ModelPerformanceSnapshot, PriceEstimate, RefreshTier, StoredListing, ValueSignal,
    VerifiedSale,
};

use crate::store::PricingStore;

#[derive(Debug, Default)]
pub struct MemoryState {
    pub items: Vec<InventoryItem>,
    pub listings: BTreeMap<String, StoredListing>,
    pub price_changes: Vec<ListingPriceChange>,
    pub supply: BTreeMap<(i64, NaiveDate), DailySupplyMetric>,
    pub estimates: BTreeMap<(i64, NaiveDate, String), PriceEstimate>,
    pub sales: Vec<VerifiedSale>,
    pub performance: BTreeMap<(NaiveDate, String), ModelPerformanceSnapshot>,
    /// Item ids whose listing writes fail
    pub fail_writes_for: HashSet<i64>,
    /// Every call fails, as if the database were unreachable
    pub unreachable: bool,
}

/// `PricingStore` with the same upsert semantics as the Postgres queries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<InventoryItem>) -> Self {
        let store = Self::new();
        store.state().items = items;
        store
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn add_listing(&self, listing: StoredListing) {
        self.state().listings.insert(listing.external_id.clone(), listing);
    }

    pub fn add_supply(&self, metric: DailySupplyMetric) {
        self.state().supply.insert((metric.item_id, metric.date), metric);
    }

    pub fn add_estimate(&self, estimate: PriceEstimate) {
        let key = (estimate.item_id, estimate.date, estimate.model_version.clone());
        self.state().estimates.insert(key, estimate);
    }

    pub fn add_sale(&self, item_id: i64, sold_date: NaiveDate, price: Decimal) {
        self.state().sales.push(VerifiedSale {
            item_id,
            sold_date,
            price,
        });
    }

    pub fn item(&self, id: i64) -> InventoryItem {
        self.state().items.iter().find(|i| i.id == id).cloned().unwrap()
    }

    pub fn listing(&self, external_id: &str) -> StoredListing {
        self.state().listings.get(external_id).cloned().unwrap()
    }

    fn check(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.unreachable {
            bail!("connection refused");
        }
        Ok(state)
    }
}

#[async_trait]
impl PricingStore for MemoryStore {
    async fn items(&self) -> Result<Vec<InventoryItem>> {
        let state = self.check()?;
        let mut items = state.items.clone();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn due_items(&self, today: NaiveDate, limit: usize) -> Result<Vec<InventoryItem>> {
        let state = self.check()?;
        let mut due: Vec<InventoryItem> = state
            .items
            .iter()
            .filter(|i| i.next_refresh_due <= today)
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.refresh_tier, i.next_refresh_due, i.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn value_signals(
        &self,
        as_of: NaiveDate,
        model_version: &str,
    ) -> Result<Vec<ValueSignal>> {
        let state = self.check()?;
        let signals = state
            .items
            .iter()
            .map(|item| {
                let latest_value = state
                    .estimates
                    .values()
                    .filter(|e| {
                        e.item_id == item.id && e.model_version == model_version && e.date <= as_of
                    })
                    .max_by_key(|e| e.date)
                    .map(|e| e.estimated_market_value);
                let latest_volume = state
                    .supply
                    .values()
                    .filter(|s| s.item_id == item.id && s.date <= as_of)
                    .max_by_key(|s| s.date)
                    .map(|s| s.active_priced_count());
                ValueSignal {
                    item_id: item.id,
                    latest_value,
                    latest_volume,
                }
            })
            .collect();
        Ok(signals)
    }

    async fn update_item_schedule(
        &self,
        item_id: i64,
        tier: RefreshTier,
        next_due: NaiveDate,
    ) -> Result<()> {
        let mut state = self.check()?;
        if state.fail_writes_for.contains(&item_id) {
            bail!("write rejected for item {item_id}");
        }
        if let Some(item) = state.items.iter_mut().find(|i| i.id == item_id) {
            item.refresh_tier = tier;
            item.next_refresh_due = next_due;
        }
        Ok(())
    }

    async fn active_listings_for_item(&self, item_id: i64) -> Result<Vec<StoredListing>> {
        let state = self.check()?;
        Ok(state
            .listings
            .values()
            .filter(|l| l.item_id == Some(item_id) && l.is_active)
            .cloned()
            .collect())
    }

    async fn apply_listing_changes(&self, changes: &ListingChangeSet) -> Result<()> {
        let mut state = self.check()?;
        if state.fail_writes_for.contains(&changes.item_id) {
            bail!("transaction aborted for item {}", changes.item_id);
        }
        let now = changes.observed_at;

        for new in &changes.inserts {
            let previous = state.listings.get(&new.external_id).cloned();
            if let Some(prev) = &previous {
                if prev.price != new.price {
                    state.price_changes.push(ListingPriceChange {
                        external_id: new.external_id.clone(),
                        old_price: prev.price,
                        new_price: new.price,
                        changed_at: now,
                    });
                }
            }
            // A stored listing keeps its item, and its flag when owned elsewhere
            let owner = previous.as_ref().and_then(|p| p.item_id).unwrap_or(new.item_id);
            let is_ignored = match &previous {
                Some(prev) if owner != new.item_id => prev.is_ignored,
                _ => new.is_ignored,
            };
            let stored = StoredListing {
                external_id: new.external_id.clone(),
                item_id: Some(owner),
                title: Some(new.title.clone()),
                price: new.price,
                currency: Some(new.currency.clone()),
                buying_options: Some(new.buying_options.clone()),
                start_date: new.start_date,
                end_date: new.end_date,
                is_active: true,
                is_ignored,
                first_seen_at: previous.map(|p| p.first_seen_at).unwrap_or(now),
                last_seen_at: now,
                disappeared_at: None,
            };
            state.listings.insert(new.external_id.clone(), stored);
        }

        for seen in &changes.seen {
            if let Some(listing) = state.listings.get_mut(&seen.external_id) {
                listing.last_seen_at = now;
                if let Some(price) = seen.price {
                    listing.price = price;
                }
            }
        }

        state.price_changes.extend(changes.price_changes.iter().cloned());

        for id in &changes.disappeared {
            if let Some(listing) = state.listings.get_mut(id) {
                if listing.is_active {
                    listing.is_active = false;
                    listing.disappeared_at = Some(now);
                }
            }
        }

        if let Some(item) = state.items.iter_mut().find(|i| i.id == changes.item_id) {
            item.refresh_tier = changes.refresh_tier;
            item.next_refresh_due = changes.next_refresh_due;
            item.last_refreshed_at = Some(now);
        }

        if let Some(backfill) = &changes.catalog_backfill {
            for item in state.items.iter_mut() {
                if backfill.item_ids.contains(&item.id) && !item.has_catalog_id() {
                    item.catalog_id = Some(backfill.catalog_id.clone());
                }
            }
        }
        Ok(())
    }

    async fn supply_listings(&self) -> Result<Vec<StoredListing>> {
        let state = self.check()?;
        Ok(state
            .listings
            .values()
            .filter(|l| l.item_id.is_some() && !l.is_ignored)
            .cloned()
            .collect())
    }

    async fn active_priced_listings(&self) -> Result<Vec<StoredListing>> {
        let state = self.check()?;
        Ok(state
            .listings
            .values()
            .filter(|l| l.item_id.is_some() && l.is_active && !l.is_ignored)
            .cloned()
            .collect())
    }

    async fn upsert_daily_supply(&self, metric: &DailySupplyMetric) -> Result<()> {
        let mut state = self.check()?;
        if state.fail_writes_for.contains(&metric.item_id) {
            bail!("write rejected for item {}", metric.item_id);
        }
        state.supply.insert((metric.item_id, metric.date), metric.clone());
        Ok(())
    }

    async fn supply_history(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailySupplyMetric>> {
        let state = self.check()?;
        Ok(state
            .supply
            .values()
            .filter(|s| s.date >= from && s.date <= to)
            .cloned()
            .collect())
    }

    async fn upsert_price_estimate(&self, estimate: &PriceEstimate) -> Result<()> {
        let mut state = self.check()?;
        if state.fail_writes_for.contains(&estimate.item_id) {
            bail!("write rejected for item {}", estimate.item_id);
        }
        let key = (estimate.item_id, estimate.date, estimate.model_version.clone());
        match state.estimates.get_mut(&key) {
            Some(row) => {
                row.estimated_market_value = estimate.estimated_market_value;
                row.driving_factor = estimate.driving_factor.clone();
                row.signal_strength = estimate.signal_strength;
                row.shock_multiplier = estimate.shock_multiplier;
            }
            None => {
                state.estimates.insert(key, estimate.clone());
            }
        }
        Ok(())
    }

    async fn price_estimates(
        &self,
        model_version: &str,
        through: NaiveDate,
    ) -> Result<Vec<PriceEstimate>> {
        let state = self.check()?;
        Ok(state
            .estimates
            .values()
            .filter(|e| e.model_version == model_version && e.date <= through)
            .cloned()
            .collect())
    }

    async fn verified_sales(&self, through: NaiveDate) -> Result<Vec<VerifiedSale>> {
        let state = self.check()?;
        Ok(state
            .sales
            .iter()
            .filter(|s| s.sold_date <= through)
            .cloned()
            .collect())
    }

    async fn record_estimate_outcome(&self, outcome: &EstimateOutcome) -> Result<bool> {
        let mut state = self.check()?;
        if state.fail_writes_for.contains(&outcome.item_id) {
            bail!("write rejected for item {}", outcome.item_id);
        }
        let key = (outcome.item_id, outcome.date, outcome.model_version.clone());
        match state.estimates.get_mut(&key) {
            Some(row) => {
                row.actual_sold_price = Some(outcome.actual_sold_price);
                row.error_pct = Some(outcome.error_pct);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_model_performance(&self, snapshot: &ModelPerformanceSnapshot) -> Result<()> {
        let mut state = self.check()?;
        state
            .performance
            .insert((snapshot.date, snapshot.model_version.clone()), snapshot.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, hour, 0, 0).unwrap()
}

pub fn item(id: i64, tier: RefreshTier, next_due: NaiveDate) -> InventoryItem {
    InventoryItem {
        id,
        player_name: "Drake Maye".to_string(),
        year: Some(2024),
        set_name: "Panini Donruss".to_string(),
        subset: Some("Downtown".to_string()),
        card_number: Some(id.to_string()),
        parallel: None,
        grader: "PSA".to_string(),
        grade: "10".to_string(),
        catalog_id: None,
        refresh_tier: tier,
        next_refresh_due: next_due,
        last_refreshed_at: None,
    }
}

pub fn stored_listing(
    external_id: &str,
    item_id: i64,
    price: Decimal,
    buying_options: &str,
    start: Option<DateTime<Utc>>,
) -> StoredListing {
    let seen = start.unwrap_or_else(|| at(2025, 1, 1, 0));
    StoredListing {
        external_id: external_id.to_string(),
        item_id: Some(item_id),
        title: Some("2024 Donruss Downtown Drake Maye PSA 10".to_string()),
        price,
        currency: Some("USD".to_string()),
        buying_options: Some(buying_options.to_string()),
        start_date: start,
        end_date: None,
        is_active: true,
        is_ignored: false,
        first_seen_at: seen,
        last_seen_at: seen,
        disappeared_at: None,
    }
}

pub fn supply_row(
    item_id: i64,
    date: NaiveDate,
    new_fixed: i32,
    median: Option<Decimal>,
) -> DailySupplyMetric {
    DailySupplyMetric {
        item_id,
        date,
        new_fixed_price_only: new_fixed,
        new_best_offer: 0,
        new_auction: 0,
        new_unknown: 0,
        active_fixed_price_only: new_fixed,
        active_best_offer: 0,
        active_auction: 0,
        active_unknown: 0,
        median_new_price: median,
    }
}

pub fn estimate_row(
    item_id: i64,
    date: NaiveDate,
    model_version: &str,
    value: Decimal,
) -> PriceEstimate {
    PriceEstimate {
        item_id,
        date,
        model_version: model_version.to_string(),
        estimated_market_value: value,
        driving_factor: "Floor".to_string(),
        signal_strength: common::SignalStrength::Medium,
        shock_multiplier: None,
        actual_sold_price: None,
        error_pct: None,
    }
}
