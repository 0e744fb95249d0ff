//! Shared data models for items, listings, and pricing output.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("refresh tier out of range: {0}")]
    InvalidTier(i16),

    #[error("unknown signal strength: {0}")]
    InvalidSignal(String),
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Refresh priority class. Lower tiers are resurveyed more often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RefreshTier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

impl RefreshTier {
    pub const ALL: [RefreshTier; 4] = [
        RefreshTier::Tier1,
        RefreshTier::Tier2,
        RefreshTier::Tier3,
        RefreshTier::Tier4,
    ];

    /// Numeric tier as stored in `inventory_items.refresh_tier`.
    pub fn as_i16(&self) -> i16 {
        match self {
            RefreshTier::Tier1 => 1,
            RefreshTier::Tier2 => 2,
            RefreshTier::Tier3 => 3,
            RefreshTier::Tier4 => 4,
        }
    }

    /// Days between resurveys.
    pub fn interval_days(&self) -> i64 {
        match self {
            RefreshTier::Tier1 => 1,
            RefreshTier::Tier2 => 2,
            RefreshTier::Tier3 => 4,
            RefreshTier::Tier4 => 7,
        }
    }

    /// Next due date when the item is (re)scheduled on `today`.
    pub fn next_due(&self, today: NaiveDate) -> NaiveDate {
        today + Duration::days(self.interval_days())
    }
}

impl TryFrom<i16> for RefreshTier {
    type Error = ModelError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RefreshTier::Tier1),
            2 => Ok(RefreshTier::Tier2),
            3 => Ok(RefreshTier::Tier3),
            4 => Ok(RefreshTier::Tier4),
            other => Err(ModelError::InvalidTier(other)),
        }
    }
}

impl fmt::Display for RefreshTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.as_i16())
    }
}

/// Normalized buying-option bucket of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuyingOption {
    Auction,
    FixedPriceOnly,
    BestOffer,
    Unknown,
}

impl BuyingOption {
    /// Classify the free-text buying options of a listing.
    ///
    /// Precedence matters: a listing offering both auction and buy-it-now is
    /// an auction, and fixed price with best offer is best offer.
    pub fn classify(raw: &str) -> Self {
        let upper = raw.to_uppercase();

        if upper.contains("AUCTION") {
            BuyingOption::Auction
        } else if upper.contains("BEST_OFFER") {
            BuyingOption::BestOffer
        } else if upper.contains("FIXED_PRICE") {
            BuyingOption::FixedPriceOnly
        } else {
            BuyingOption::Unknown
        }
    }

    /// Fixed-price style listings whose asking price is a usable price signal.
    pub fn is_priced(&self) -> bool {
        matches!(self, BuyingOption::FixedPriceOnly | BuyingOption::BestOffer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuyingOption::Auction => "AUCTION",
            BuyingOption::FixedPriceOnly => "FIXED_PRICE_ONLY",
            BuyingOption::BestOffer => "BEST_OFFER",
            BuyingOption::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BuyingOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Confidence attached to a daily estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalStrength {
    Low,
    Medium,
    High,
}

impl SignalStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStrength::Low => "Low",
            SignalStrength::Medium => "Medium",
            SignalStrength::High => "High",
        }
    }
}

impl TryFrom<String> for SignalStrength {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "Low" => Ok(SignalStrength::Low),
            "Medium" => Ok(SignalStrength::Medium),
            "High" => Ok(SignalStrength::High),
            _ => Err(ModelError::InvalidSignal(value)),
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stored rows
// ---------------------------------------------------------------------------

/// A tracked print/grade combination.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryItem {
    pub id: i64,
    pub player_name: String,
    pub year: Option<i32>,
    pub set_name: String,
    pub subset: Option<String>,
    pub card_number: Option<String>,
    pub parallel: Option<String>,
    pub grader: String,
    pub grade: String,
    /// Marketplace catalog product id (eBay EPID), when known
    pub catalog_id: Option<String>,
    #[sqlx(try_from = "i16")]
    pub refresh_tier: RefreshTier,
    pub next_refresh_due: NaiveDate,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl InventoryItem {
    /// Keyword search for items without a catalog id.
    pub fn search_keywords(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(year) = self.year {
            parts.push(year.to_string());
        }
        parts.push(self.set_name.clone());
        if let Some(subset) = self.subset.as_deref().filter(|s| !s.is_empty()) {
            parts.push(subset.to_string());
        }
        parts.push(self.player_name.clone());
        if let Some(number) = self.card_number.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("#{number}"));
        }
        if let Some(parallel) = self.parallel.as_deref().filter(|s| !s.is_empty()) {
            parts.push(parallel.to_string());
        }
        if !self.grader.eq_ignore_ascii_case("raw") {
            parts.push(format!("{} {}", self.grader, self.grade));
        }
        parts.push("-reprint -digital -break -razz".to_string());
        parts.join(" ")
    }

    pub fn has_catalog_id(&self) -> bool {
        self.catalog_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }

    /// Another grade of the same card: a shared catalog id, or the same
    /// print identity (player, year, set, subset, number, parallel).
    pub fn is_variant_of(&self, other: &InventoryItem) -> bool {
        if self.id == other.id {
            return false;
        }
        if let (Some(a), Some(b)) = (self.catalog_id.as_deref(), other.catalog_id.as_deref()) {
            if !a.trim().is_empty() && a.trim() == b.trim() {
                return true;
            }
        }
        self.player_name.eq_ignore_ascii_case(&other.player_name)
            && self.year == other.year
            && self.set_name.eq_ignore_ascii_case(&other.set_name)
            && self.subset == other.subset
            && self.card_number == other.card_number
            && self.parallel == other.parallel
    }
}

/// A listing as recorded in the `listings` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredListing {
    pub external_id: String,
    pub item_id: Option<i64>,
    pub title: Option<String>,
    pub price: Decimal,
    pub currency: Option<String>,
    /// Raw comma-separated buying options as received
    pub buying_options: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_ignored: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub disappeared_at: Option<DateTime<Utc>>,
}

impl StoredListing {
    pub fn buying_option(&self) -> BuyingOption {
        BuyingOption::classify(self.buying_options.as_deref().unwrap_or_default())
    }
}

/// Append-only record of a listing's asking price moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ListingPriceChange {
    pub external_id: String,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub changed_at: DateTime<Utc>,
}

/// Daily per-item supply statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailySupplyMetric {
    pub item_id: i64,
    pub date: NaiveDate,
    pub new_fixed_price_only: i32,
    pub new_best_offer: i32,
    pub new_auction: i32,
    pub new_unknown: i32,
    pub active_fixed_price_only: i32,
    pub active_best_offer: i32,
    pub active_auction: i32,
    pub active_unknown: i32,
    /// Median asking price of the day's new fixed-price/best-offer listings
    pub median_new_price: Option<Decimal>,
}

impl DailySupplyMetric {
    /// New listings excluding auctions and unclassified ones.
    pub fn new_priced_count(&self) -> i64 {
        i64::from(self.new_fixed_price_only) + i64::from(self.new_best_offer)
    }

    /// Active depth excluding auctions and unclassified ones.
    pub fn active_priced_count(&self) -> i64 {
        i64::from(self.active_fixed_price_only) + i64::from(self.active_best_offer)
    }
}

/// One daily value estimate (a `price_history` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PriceEstimate {
    pub item_id: i64,
    pub date: NaiveDate,
    pub model_version: String,
    pub estimated_market_value: Decimal,
    pub driving_factor: String,
    #[sqlx(try_from = "String")]
    pub signal_strength: SignalStrength,
    pub shock_multiplier: Option<Decimal>,
    pub actual_sold_price: Option<Decimal>,
    pub error_pct: Option<Decimal>,
}

/// Verified outcome written back onto an existing estimate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateOutcome {
    pub item_id: i64,
    pub date: NaiveDate,
    pub model_version: String,
    pub actual_sold_price: Decimal,
    pub error_pct: Decimal,
}

/// Accuracy of one model version on one validation date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ModelPerformanceSnapshot {
    pub date: NaiveDate,
    pub model_version: String,
    pub rmse: f64,
    pub mae: f64,
    pub bias: f64,
    pub mape: f64,
    /// Percentage (0-100) of validated sales within the hit threshold
    pub hit_rate: f64,
    pub sample_count: i32,
}

/// A completed transaction for a sentinel item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VerifiedSale {
    pub item_id: i64,
    pub sold_date: NaiveDate,
    pub price: Decimal,
}

/// Latest persisted value/volume knowledge for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ValueSignal {
    pub item_id: i64,
    pub latest_value: Option<Decimal>,
    pub latest_volume: Option<i64>,
}

// ---------------------------------------------------------------------------
// Reconciliation write set
// ---------------------------------------------------------------------------

/// A listing observed for the first time (or relisted) during a refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    pub external_id: String,
    pub item_id: i64,
    pub title: String,
    pub price: Decimal,
    pub currency: String,
    pub buying_options: String,
    pub location_country: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_ignored: bool,
}

/// A stored active listing seen again. `price` is None when the fetched
/// record was identifiable but its price unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenListing {
    pub external_id: String,
    pub price: Option<Decimal>,
}

/// Catalog id learned from listings, written to items that lack one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogBackfill {
    pub catalog_id: String,
    /// The refreshed item and its grade variants
    pub item_ids: Vec<i64>,
}

/// Every write produced by reconciling one item. Applied atomically.
/// Inserts may be routed to a grade variant of `item_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingChangeSet {
    pub item_id: i64,
    pub observed_at: DateTime<Utc>,
    pub inserts: Vec<NewListing>,
    pub seen: Vec<SeenListing>,
    pub price_changes: Vec<ListingPriceChange>,
    pub disappeared: Vec<String>,
    pub refresh_tier: RefreshTier,
    pub next_refresh_due: NaiveDate,
    pub catalog_backfill: Option<CatalogBackfill>,
}

/// What to ask the marketplace for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingQuery {
    /// Catalog product id (EPID)
    Catalog(String),
    /// Free-text search
    Keywords(String),
}

impl ListingQuery {
    pub fn for_item(item: &InventoryItem) -> Self {
        match item.catalog_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => ListingQuery::Catalog(id.to_string()),
            _ => ListingQuery::Keywords(item.search_keywords()),
        }
    }
}

/// One record as returned by a listings provider, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: Option<String>,
    pub title: Option<String>,
    /// Price as sent by the marketplace; parsed during reconciliation
    pub price: Option<String>,
    pub currency: Option<String>,
    pub buying_options: Vec<String>,
    pub location_country: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Catalog product id the marketplace attached to the listing
    pub epid: Option<String>,
}

/// One page of provider results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingPage {
    pub records: Vec<RawListing>,
    /// Offset of the following page, None on the last page
    pub next_offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> InventoryItem {
        InventoryItem {
            id: 7,
            player_name: "Drake Maye".to_string(),
            year: Some(2024),
            set_name: "Panini Donruss".to_string(),
            subset: Some("Downtown".to_string()),
            card_number: Some("12".to_string()),
            parallel: None,
            grader: "PSA".to_string(),
            grade: "10".to_string(),
            catalog_id: None,
            refresh_tier: RefreshTier::Tier4,
            next_refresh_due: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            last_refreshed_at: None,
        }
    }

    #[test]
    fn test_buying_option_precedence() {
        assert_eq!(BuyingOption::classify("AUCTION,FIXED_PRICE"), BuyingOption::Auction);
        assert_eq!(BuyingOption::classify("FIXED_PRICE,BEST_OFFER"), BuyingOption::BestOffer);
        assert_eq!(BuyingOption::classify("FIXED_PRICE"), BuyingOption::FixedPriceOnly);
        assert_eq!(BuyingOption::classify("fixed_price"), BuyingOption::FixedPriceOnly);
        assert_eq!(BuyingOption::classify(""), BuyingOption::Unknown);
        assert_eq!(BuyingOption::classify("CLASSIFIED_AD"), BuyingOption::Unknown);
    }

    #[test]
    fn test_buying_option_priced() {
        assert!(BuyingOption::FixedPriceOnly.is_priced());
        assert!(BuyingOption::BestOffer.is_priced());
        assert!(!BuyingOption::Auction.is_priced());
        assert!(!BuyingOption::Unknown.is_priced());
    }

    #[test]
    fn test_refresh_tier_intervals() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(RefreshTier::Tier1.next_due(today), NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        assert_eq!(RefreshTier::Tier2.next_due(today), NaiveDate::from_ymd_opt(2025, 6, 3).unwrap());
        assert_eq!(RefreshTier::Tier3.next_due(today), NaiveDate::from_ymd_opt(2025, 6, 5).unwrap());
        assert_eq!(RefreshTier::Tier4.next_due(today), NaiveDate::from_ymd_opt(2025, 6, 8).unwrap());
    }

    #[test]
    fn test_refresh_tier_round_trips_storage_value() {
        for tier in RefreshTier::ALL {
            assert_eq!(RefreshTier::try_from(tier.as_i16()).unwrap(), tier);
        }
        assert!(RefreshTier::try_from(0).is_err());
        assert!(RefreshTier::try_from(5).is_err());
    }

    #[test]
    fn test_signal_strength_parse() {
        assert_eq!(SignalStrength::try_from("High".to_string()).unwrap(), SignalStrength::High);
        assert!(SignalStrength::try_from("high".to_string()).is_err());
    }

    #[test]
    fn test_query_prefers_catalog_id() {
        let mut it = item();
        it.catalog_id = Some("2345678".to_string());
        assert_eq!(ListingQuery::for_item(&it), ListingQuery::Catalog("2345678".to_string()));
    }

    #[test]
    fn test_query_falls_back_to_keywords() {
        let mut it = item();
        it.catalog_id = Some("  ".to_string());
        match ListingQuery::for_item(&it) {
            ListingQuery::Keywords(q) => {
                assert!(q.starts_with("2024 Panini Donruss Downtown Drake Maye #12 PSA 10"));
                assert!(q.ends_with("-reprint -digital -break -razz"));
            }
            other => panic!("expected keywords, got {other:?}"),
        }
    }

    #[test]
    fn test_supply_priced_counts_exclude_auctions() {
        let metric = DailySupplyMetric {
            item_id: 1,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            new_fixed_price_only: 3,
            new_best_offer: 2,
            new_auction: 9,
            new_unknown: 1,
            active_fixed_price_only: 10,
            active_best_offer: 5,
            active_auction: 40,
            active_unknown: 2,
            median_new_price: None,
        };
        assert_eq!(metric.new_priced_count(), 5);
        assert_eq!(metric.active_priced_count(), 15);
    }

    #[test]
    fn test_grade_variants() {
        let psa10 = item();
        let mut psa9 = item();
        psa9.id = 8;
        psa9.grade = "9".to_string();
        assert!(psa9.is_variant_of(&psa10));
        assert!(!psa10.is_variant_of(&psa10));

        let mut other_number = item();
        other_number.id = 9;
        other_number.card_number = Some("13".to_string());
        assert!(!other_number.is_variant_of(&psa10));

        // A shared catalog id links items whose identity text differs
        let mut a = psa10.clone();
        a.catalog_id = Some("E1".to_string());
        other_number.catalog_id = Some("E1".to_string());
        assert!(other_number.is_variant_of(&a));
    }
}
