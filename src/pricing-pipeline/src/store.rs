//! Persisted-state seam shared by every stage.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use common::models::{
    DailySupplyMetric, EstimateOutcome, InventoryItem, ListingChangeSet,
    ModelPerformanceSnapshot, PriceEstimate, RefreshTier, StoredListing, ValueSignal,
    VerifiedSale,
};
use common::{repository, Database};

/// Storage operations the stages depend on. Stages talk to each other only
/// through this state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PricingStore: Send + Sync {
    async fn items(&self) -> Result<Vec<InventoryItem>>;

    /// Items due on or before `today`, ordered by (tier, due date).
    async fn due_items(&self, today: NaiveDate, limit: usize) -> Result<Vec<InventoryItem>>;

    async fn value_signals(&self, as_of: NaiveDate, model_version: &str)
        -> Result<Vec<ValueSignal>>;

    async fn update_item_schedule(
        &self,
        item_id: i64,
        tier: RefreshTier,
        next_due: NaiveDate,
    ) -> Result<()>;

    async fn active_listings_for_item(&self, item_id: i64) -> Result<Vec<StoredListing>>;

    /// Apply one item's reconciliation atomically.
    async fn apply_listing_changes(&self, changes: &ListingChangeSet) -> Result<()>;

    async fn supply_listings(&self) -> Result<Vec<StoredListing>>;

    async fn active_priced_listings(&self) -> Result<Vec<StoredListing>>;

    async fn upsert_daily_supply(&self, metric: &DailySupplyMetric) -> Result<()>;

    async fn supply_history(&self, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<DailySupplyMetric>>;

    async fn upsert_price_estimate(&self, estimate: &PriceEstimate) -> Result<()>;

    async fn price_estimates(
        &self,
        model_version: &str,
        through: NaiveDate,
    ) -> Result<Vec<PriceEstimate>>;

    async fn verified_sales(&self, through: NaiveDate) -> Result<Vec<VerifiedSale>>;

    /// Returns false when no estimate row matched.
    async fn record_estimate_outcome(&self, outcome: &EstimateOutcome) -> Result<bool>;

    async fn upsert_model_performance(&self, snapshot: &ModelPerformanceSnapshot) -> Result<()>;
}

/// Postgres-backed store.
pub struct PgPricingStore {
    db: Database,
}

impl PgPricingStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PricingStore for PgPricingStore {
    async fn items(&self) -> Result<Vec<InventoryItem>> {
        Ok(repository::get_items(self.db.pool()).await?)
    }

    async fn due_items(&self, today: NaiveDate, limit: usize) -> Result<Vec<InventoryItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(repository::get_due_items(self.db.pool(), today, limit).await?)
    }

    async fn value_signals(
        &self,
        as_of: NaiveDate,
        model_version: &str,
    ) -> Result<Vec<ValueSignal>> {
        Ok(repository::get_value_signals(self.db.pool(), as_of, model_version).await?)
    }

    async fn update_item_schedule(
        &self,
        item_id: i64,
        tier: RefreshTier,
        next_due: NaiveDate,
    ) -> Result<()> {
        repository::update_item_schedule(self.db.pool(), item_id, tier, next_due).await?;
        Ok(())
    }

    async fn active_listings_for_item(&self, item_id: i64) -> Result<Vec<StoredListing>> {
        Ok(repository::get_active_listings_for_item(self.db.pool(), item_id).await?)
    }

    async fn apply_listing_changes(&self, changes: &ListingChangeSet) -> Result<()> {
        Ok(repository::apply_listing_changes(self.db.pool(), changes).await?)
    }

    async fn supply_listings(&self) -> Result<Vec<StoredListing>> {
        Ok(repository::get_supply_listings(self.db.pool()).await?)
    }

    async fn active_priced_listings(&self) -> Result<Vec<StoredListing>> {
        Ok(repository::get_active_priced_listings(self.db.pool()).await?)
    }

    async fn upsert_daily_supply(&self, metric: &DailySupplyMetric) -> Result<()> {
        Ok(repository::upsert_daily_supply(self.db.pool(), metric).await?)
    }

    async fn supply_history(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailySupplyMetric>> {
        Ok(repository::get_supply_history(self.db.pool(), from, to).await?)
    }

    async fn upsert_price_estimate(&self, estimate: &PriceEstimate) -> Result<()> {
        Ok(repository::upsert_price_estimate(self.db.pool(), estimate).await?)
    }

    async fn price_estimates(
        &self,
        model_version: &str,
        through: NaiveDate,
    ) -> Result<Vec<PriceEstimate>> {
        Ok(repository::get_price_estimates(self.db.pool(), model_version, through).await?)
    }

    async fn verified_sales(&self, through: NaiveDate) -> Result<Vec<VerifiedSale>> {
        Ok(repository::get_verified_sales(self.db.pool(), through).await?)
    }

    async fn record_estimate_outcome(&self, outcome: &EstimateOutcome) -> Result<bool> {
        let rows = repository::record_estimate_outcome(self.db.pool(), outcome).await?;
        Ok(rows > 0)
    }

    async fn upsert_model_performance(&self, snapshot: &ModelPerformanceSnapshot) -> Result<()> {
        Ok(repository::upsert_model_performance(self.db.pool(), snapshot).await?)
    }
}
