//! Listing reconciliation engine.
//!
//! For each due item the freshly fetched listing ids are diffed against the
//! item's stored active set:
//! - new = fetched - stored: inserted (or reactivated) as active
//! - existing = fetched ∩ stored: last-seen refreshed, price moves recorded
//! - disappeared = stored - fetched: deactivated, never deleted
//!
//! Grade variants of one card share a catalog search, so a fetch also returns
//! their listings. Those already stored under a variant are only marked seen,
//! and new ones whose title names a variant's grade are inserted under that
//! variant. All writes for one item, schedule advance included, commit together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use common::classify::{is_low_quality_title, is_price_outlier, title_matches_grade};
use common::models::{
    CatalogBackfill, InventoryItem, ListingChangeSet, ListingPriceChange, ListingQuery,
    NewListing, RawListing, RefreshTier, SeenListing, StoredListing,
};

use crate::config::PipelineConfig;
use crate::provider::{FetchError, ListingsProvider};
use crate::scheduler::{select_due, signals_by_item, tier_distribution};
use crate::store::PricingStore;
use crate::summary::RefreshSummary;
use crate::supply::median;

/// A fetched record that carries an identifier in the configured currency.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedListing {
    pub external_id: String,
    pub title: String,
    /// None when the record's price was missing, unparseable or non-positive
    pub price: Option<Decimal>,
    pub currency: String,
    pub buying_options: String,
    pub location_country: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub epid: Option<String>,
}

/// Per-fetch record bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTally {
    pub rejected: usize,
    pub filtered: usize,
    pub duplicates: usize,
}

/// Tier and due date written when the reconciliation commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub tier: RefreshTier,
    pub next_due: NaiveDate,
}

/// Other grades of the item's card and their active listings.
#[derive(Debug, Clone, Default)]
pub struct Variants {
    pub items: Vec<InventoryItem>,
    pub listings: Vec<StoredListing>,
}

impl Variants {
    /// Item a listing belongs to: the refreshed item when the title names its
    /// grade, else the first variant whose grade it names, else the item.
    fn owner_of<'a>(&'a self, item: &'a InventoryItem, title: &str) -> &'a InventoryItem {
        if title_matches_grade(title, &item.grader, &item.grade) {
            return item;
        }
        self.items
            .iter()
            .find(|v| title_matches_grade(title, &v.grader, &v.grade))
            .unwrap_or(item)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPlan {
    pub new: BTreeSet<String>,
    pub existing: BTreeSet<String>,
    /// Fetched ids already active under a grade variant
    pub elsewhere: BTreeSet<String>,
    pub disappeared: BTreeSet<String>,
    /// New listings inserted under a grade variant
    pub routed: usize,
    /// New ids not inserted because their price was unusable
    pub unpriced_new: usize,
    pub changes: ListingChangeSet,
}

/// Page requests left in this pass.
#[derive(Debug)]
pub struct CallBudget {
    remaining: usize,
    used: usize,
}

impl CallBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: limit,
            used: 0,
        }
    }

    pub fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.used += 1;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Drop records that cannot be reconciled and normalize the rest.
///
/// Records without an id are rejected outright. Records with an id but an
/// unusable price are rejected too, yet still returned (unpriced) so the
/// listing counts as observed. Foreign-currency records are filtered out and
/// repeated ids keep their first occurrence.
pub fn validate_records(
    records: Vec<RawListing>,
    currency: &str,
) -> (Vec<FetchedListing>, RecordTally) {
    let mut tally = RecordTally::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut valid = Vec::with_capacity(records.len());

    for record in records {
        let Some(external_id) = record.external_id.map(|id| id.trim().to_string()) else {
            debug!("Rejecting record without an id: {:?}", record.title);
            tally.rejected += 1;
            continue;
        };
        if external_id.is_empty() {
            tally.rejected += 1;
            continue;
        }

        let record_currency = record
            .currency
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| currency.to_string());
        if !record_currency.eq_ignore_ascii_case(currency) {
            debug!("Filtering {} priced in {}", external_id, record_currency);
            tally.filtered += 1;
            continue;
        }

        if !seen.insert(external_id.clone()) {
            tally.duplicates += 1;
            continue;
        }

        let price = record
            .price
            .as_deref()
            .and_then(|p| p.trim().parse::<Decimal>().ok())
            .filter(|p| *p > Decimal::ZERO);
        if price.is_none() {
            debug!("Unusable price {:?} on {}", record.price, external_id);
            tally.rejected += 1;
        }

        valid.push(FetchedListing {
            external_id,
            title: record.title.unwrap_or_default(),
            price,
            currency: record_currency.to_uppercase(),
            buying_options: record.buying_options.join(","),
            location_country: record.location_country,
            start_date: record.start_date,
            end_date: record.end_date,
            epid: record.epid.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        });
    }

    (valid, tally)
}

/// Partition fetched vs stored ids and build the write set for one item.
///
/// `new`, `existing` and `elsewhere` partition the fetched ids; `existing`
/// and `disappeared` partition the item's own stored ids.
pub fn plan_reconciliation(
    item: &InventoryItem,
    variants: &Variants,
    stored: &[StoredListing],
    fetched: &[FetchedListing],
    now: DateTime<Utc>,
    schedule: Schedule,
) -> ReconciliationPlan {
    let stored_by_id: HashMap<&str, &StoredListing> =
        stored.iter().map(|l| (l.external_id.as_str(), l)).collect();
    let variant_by_id: HashMap<&str, &StoredListing> = variants
        .listings
        .iter()
        .filter(|l| !stored_by_id.contains_key(l.external_id.as_str()))
        .map(|l| (l.external_id.as_str(), l))
        .collect();

    let fetched_ids: BTreeSet<String> = fetched.iter().map(|f| f.external_id.clone()).collect();
    let stored_ids: BTreeSet<String> = stored_by_id.keys().map(|id| id.to_string()).collect();
    let variant_ids: BTreeSet<String> = variant_by_id.keys().map(|id| id.to_string()).collect();

    let existing: BTreeSet<String> = fetched_ids.intersection(&stored_ids).cloned().collect();
    let elsewhere: BTreeSet<String> = fetched_ids.intersection(&variant_ids).cloned().collect();
    let new: BTreeSet<String> = fetched_ids
        .iter()
        .filter(|id| !existing.contains(*id) && !elsewhere.contains(*id))
        .cloned()
        .collect();
    let disappeared: BTreeSet<String> = stored_ids.difference(&fetched_ids).cloned().collect();

    let batch_median = median(fetched.iter().filter_map(|f| f.price).collect());

    let mut inserts = Vec::new();
    let mut seen = Vec::new();
    let mut price_changes = Vec::new();
    let mut unpriced_new = 0;
    let mut routed = 0;

    for listing in fetched {
        let id = listing.external_id.as_str();
        if let Some(prev) = stored_by_id.get(id).or_else(|| variant_by_id.get(id)) {
            if let Some(price) = listing.price {
                if price != prev.price {
                    price_changes.push(ListingPriceChange {
                        external_id: listing.external_id.clone(),
                        old_price: prev.price,
                        new_price: price,
                        changed_at: now,
                    });
                }
            }
            seen.push(SeenListing {
                external_id: listing.external_id.clone(),
                price: listing.price,
            });
            continue;
        }

        let Some(price) = listing.price else {
            unpriced_new += 1;
            continue;
        };

        let owner = variants.owner_of(item, &listing.title);
        if owner.id != item.id {
            routed += 1;
        }

        let is_ignored = is_low_quality_title(&listing.title)
            || !title_matches_grade(&listing.title, &owner.grader, &owner.grade)
            || is_price_outlier(price, batch_median);

        inserts.push(NewListing {
            external_id: listing.external_id.clone(),
            item_id: owner.id,
            title: listing.title.clone(),
            price,
            currency: listing.currency.clone(),
            buying_options: listing.buying_options.clone(),
            location_country: listing.location_country.clone(),
            start_date: listing.start_date,
            end_date: listing.end_date,
            is_ignored,
        });
    }

    let catalog_backfill = if item.has_catalog_id() {
        None
    } else {
        fetched
            .iter()
            .filter(|f| !is_low_quality_title(&f.title))
            .find_map(|f| f.epid.clone())
            .map(|catalog_id| CatalogBackfill {
                catalog_id,
                item_ids: std::iter::once(item.id)
                    .chain(variants.items.iter().filter(|v| !v.has_catalog_id()).map(|v| v.id))
                    .collect(),
            })
    };

    let changes = ListingChangeSet {
        item_id: item.id,
        observed_at: now,
        inserts,
        seen,
        price_changes,
        disappeared: disappeared.iter().cloned().collect(),
        refresh_tier: schedule.tier,
        next_refresh_due: schedule.next_due,
        catalog_backfill,
    };

    ReconciliationPlan {
        new,
        existing,
        elsewhere,
        disappeared,
        routed,
        unpriced_new,
        changes,
    }
}

/// Active listings of every grade variant of `item`.
async fn load_variants(
    store: &dyn PricingStore,
    item: &InventoryItem,
    all_items: &[InventoryItem],
) -> Result<Variants> {
    let items: Vec<InventoryItem> = all_items
        .iter()
        .filter(|other| other.is_variant_of(item))
        .cloned()
        .collect();

    let mut listings = Vec::new();
    for variant in &items {
        listings.extend(store.active_listings_for_item(variant.id).await?);
    }

    Ok(Variants { items, listings })
}

/// Fetch every page for one item, bounded by `max_pages_per_item`.
async fn fetch_listings(
    provider: &dyn ListingsProvider,
    query: &ListingQuery,
    config: &PipelineConfig,
    budget: &mut CallBudget,
) -> Result<Vec<RawListing>, FetchError> {
    let mut records = Vec::new();
    let mut offset = 0;

    for _ in 0..config.max_pages_per_item {
        if !budget.take() {
            return Err(FetchError::BudgetExhausted);
        }

        let page = provider.fetch_page(query, offset).await?;
        records.extend(page.records);

        match page.next_offset {
            Some(next) if next > offset => offset = next,
            _ => return Ok(records),
        }
    }

    warn!(
        "Stopped after {} pages for {:?}; remaining results not fetched",
        config.max_pages_per_item, query
    );
    Ok(records)
}

/// Refresh every due item: fetch, reconcile, commit, advance schedule.
pub async fn refresh_due_items(
    store: &dyn PricingStore,
    provider: &dyn ListingsProvider,
    config: &PipelineConfig,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<RefreshSummary> {
    let due = select_due(store, today, config.max_items_per_pass).await?;
    if due.is_empty() {
        info!("No items due on {}", today);
        return Ok(RefreshSummary::new(today));
    }
    let all_items = store.items().await?;
    let signals = signals_by_item(store.value_signals(today, config.model_version()).await?);

    let mut summary = RefreshSummary::new(today);
    summary.due = due.len();
    summary.due_by_tier = tier_distribution(&due);

    info!("Refreshing {} due items", due.len());

    let mut budget = CallBudget::new(config.max_calls_per_pass);

    for (idx, item) in due.iter().enumerate() {
        if budget.is_exhausted() {
            summary.skipped_budget = due.len() - idx;
            warn!("Call budget exhausted; {} items left for the next pass", summary.skipped_budget);
            break;
        }

        if idx > 0 && config.inter_item_delay > Duration::ZERO {
            sleep(config.inter_item_delay).await;
        }

        let query = ListingQuery::for_item(item);
        let fetched = match timeout(
            config.fetch_timeout,
            fetch_listings(provider, &query, config, &mut budget),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(config.fetch_timeout)),
        };

        let records = match fetched {
            Ok(records) => records,
            Err(FetchError::BudgetExhausted) => {
                summary.skipped_budget = due.len() - idx;
                warn!(
                    "Call budget exhausted mid-fetch of item {}; {} items left for the next pass",
                    item.id, summary.skipped_budget
                );
                break;
            }
            Err(e) => {
                warn!("Fetch failed for item {}: {}", item.id, e);
                summary.fetch_failed += 1;
                continue;
            }
        };

        let (valid, tally) = validate_records(records, &config.currency);
        summary.records_rejected += tally.rejected;
        summary.records_filtered += tally.filtered;
        summary.records_duplicate += tally.duplicates;

        let stored = match store.active_listings_for_item(item.id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to load stored listings for item {}: {}", item.id, e);
                summary.write_failed += 1;
                continue;
            }
        };

        let variants = match load_variants(store, item, &all_items).await {
            Ok(variants) => variants,
            Err(e) => {
                warn!("Failed to load grade variants of item {}: {}", item.id, e);
                summary.write_failed += 1;
                continue;
            }
        };

        let tier = config.tiers.classify_signal(signals.get(&item.id));
        let schedule = Schedule {
            tier,
            next_due: tier.next_due(today),
        };
        let plan = plan_reconciliation(item, &variants, &stored, &valid, now, schedule);

        if let Err(e) = store.apply_listing_changes(&plan.changes).await {
            warn!("Failed to commit reconciliation for item {}: {}", item.id, e);
            summary.write_failed += 1;
            continue;
        }

        debug!(
            "Item {}: {} new, {} existing, {} disappeared, next due {}",
            item.id,
            plan.new.len(),
            plan.existing.len(),
            plan.disappeared.len(),
            schedule.next_due
        );

        summary.refreshed += 1;
        summary.listings_new += plan.changes.inserts.len();
        summary.listings_existing += plan.existing.len();
        summary.listings_elsewhere += plan.elsewhere.len();
        summary.listings_routed += plan.routed;
        if let Some(backfill) = &plan.changes.catalog_backfill {
            info!("Item {}: learned catalog id {}", item.id, backfill.catalog_id);
            summary.catalog_backfilled += 1;
        }
        summary.listings_disappeared += plan.disappeared.len();
        summary.listings_ignored += plan.changes.inserts.iter().filter(|l| l.is_ignored).count();
        summary.price_changes += plan.changes.price_changes.len();
    }

    summary.page_calls = budget.used();

    info!(
        "Refresh complete: {}/{} refreshed, {} fetch failures, {} write failures",
        summary.refreshed, summary.due, summary.fetch_failed, summary.write_failed
    );

    Ok(summary)
}
