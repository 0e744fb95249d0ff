//! Supply aggregator: daily per-item listing counts and new-listing medians.
//!
//! Only listings still stored feed the active counts, so history rebuilt for
//! past dates understates supply for listings that have since been removed.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{info, warn};

use common::models::{BuyingOption, DailySupplyMetric, StoredListing};

use crate::store::PricingStore;
use crate::summary::SupplySummary;

/// Median of a price list, rounded to cents. None when empty.
pub fn median(mut prices: Vec<Decimal>) -> Option<Decimal> {
    if prices.is_empty() {
        return None;
    }
    prices.sort();

    let mid = prices.len() / 2;
    let value = if prices.len() % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / Decimal::TWO
    } else {
        prices[mid]
    };

    Some(value.round_dp(2))
}

/// Supply statistics of one item on `date`.
///
/// "New" listings started on `date`; "active" listings started on or before
/// it. Listings without a start date are not counted.
pub fn aggregate_item(item_id: i64, listings: &[StoredListing], date: NaiveDate) -> DailySupplyMetric {
    let mut metric = DailySupplyMetric {
        item_id,
        date,
        new_fixed_price_only: 0,
        new_best_offer: 0,
        new_auction: 0,
        new_unknown: 0,
        active_fixed_price_only: 0,
        active_best_offer: 0,
        active_auction: 0,
        active_unknown: 0,
        median_new_price: None,
    };
    let mut new_prices = Vec::new();

    for listing in listings {
        let Some(start) = listing.start_date.map(|s| s.date_naive()) else {
            continue;
        };
        if start > date {
            continue;
        }

        let option = listing.buying_option();
        match option {
            BuyingOption::FixedPriceOnly => metric.active_fixed_price_only += 1,
            BuyingOption::BestOffer => metric.active_best_offer += 1,
            BuyingOption::Auction => metric.active_auction += 1,
            BuyingOption::Unknown => metric.active_unknown += 1,
        }

        if start == date {
            match option {
                BuyingOption::FixedPriceOnly => metric.new_fixed_price_only += 1,
                BuyingOption::BestOffer => metric.new_best_offer += 1,
                BuyingOption::Auction => metric.new_auction += 1,
                BuyingOption::Unknown => metric.new_unknown += 1,
            }
            if option.is_priced() && listing.price > Decimal::ZERO {
                new_prices.push(listing.price);
            }
        }
    }

    metric.median_new_price = median(new_prices);
    metric
}

/// Recompute and upsert the supply row of every listed item for `date`.
pub async fn run_supply(store: &dyn PricingStore, date: NaiveDate) -> Result<SupplySummary> {
    let listings = store.supply_listings().await?;

    let mut summary = SupplySummary::new(date);
    summary.listings_scanned = listings.len();
    summary.undated_listings = listings.iter().filter(|l| l.start_date.is_none()).count();

    let mut by_item: BTreeMap<i64, Vec<StoredListing>> = BTreeMap::new();
    for listing in listings {
        if let Some(item_id) = listing.item_id {
            by_item.entry(item_id).or_default().push(listing);
        }
    }
    summary.items = by_item.len();

    for (item_id, item_listings) in &by_item {
        let metric = aggregate_item(*item_id, item_listings, date);

        match store.upsert_daily_supply(&metric).await {
            Ok(()) => {
                summary.rows_written += 1;
                summary.new_listings += metric.new_priced_count()
                    + i64::from(metric.new_auction)
                    + i64::from(metric.new_unknown);
                summary.active_listings += metric.active_priced_count()
                    + i64::from(metric.active_auction)
                    + i64::from(metric.active_unknown);
            }
            Err(e) => {
                warn!("Failed to write supply for item {}: {}", item_id, e);
                summary.rows_failed += 1;
            }
        }
    }

    info!(
        "Supply for {}: {} rows written from {} listings ({} undated)",
        date, summary.rows_written, summary.listings_scanned, summary.undated_listings
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, date, item, stored_listing, MemoryStore};
    use common::models::RefreshTier;
    use rust_decimal_macros::dec;

    #[test]
    fn test_median() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![dec!(24), dec!(20), dec!(22)]), Some(dec!(22)));
        assert_eq!(median(vec![dec!(10), dec!(15)]), Some(dec!(12.5)));
        assert_eq!(median(vec![dec!(1.01), dec!(1.02)]), Some(dec!(1.02)));
    }

    #[test]
    fn test_aggregate_buckets() {
        let d = date(2025, 6, 1);
        let listings = vec![
            stored_listing("n1", 1, dec!(20), "FIXED_PRICE", Some(at(2025, 6, 1, 8))),
            stored_listing("n2", 1, dec!(24), "FIXED_PRICE,BEST_OFFER", Some(at(2025, 6, 1, 9))),
            stored_listing("n3", 1, dec!(1), "AUCTION,FIXED_PRICE", Some(at(2025, 6, 1, 10))),
            stored_listing("n4", 1, dec!(500), "CLASSIFIED_AD", Some(at(2025, 6, 1, 11))),
            stored_listing("o1", 1, dec!(30), "FIXED_PRICE", Some(at(2025, 5, 20, 0))),
            stored_listing("future", 1, dec!(30), "FIXED_PRICE", Some(at(2025, 6, 2, 0))),
            stored_listing("undated", 1, dec!(30), "FIXED_PRICE", None),
        ];

        let metric = aggregate_item(1, &listings, d);

        assert_eq!(metric.new_fixed_price_only, 1);
        assert_eq!(metric.new_best_offer, 1);
        assert_eq!(metric.new_auction, 1);
        assert_eq!(metric.new_unknown, 1);
        assert_eq!(metric.active_fixed_price_only, 2);
        assert_eq!(metric.active_best_offer, 1);
        assert_eq!(metric.active_auction, 1);
        assert_eq!(metric.active_unknown, 1);
        // Auction and unclassified prices stay out of the median
        assert_eq!(metric.median_new_price, Some(dec!(22)));
    }

    #[test]
    fn test_inactive_listings_still_count_as_active_supply() {
        let d = date(2025, 6, 1);
        let mut removed = stored_listing("r1", 1, dec!(30), "FIXED_PRICE", Some(at(2025, 5, 1, 0)));
        removed.is_active = false;
        removed.disappeared_at = Some(at(2025, 5, 15, 0));

        let metric = aggregate_item(1, &[removed], d);
        assert_eq!(metric.active_fixed_price_only, 1);
    }

    #[test]
    fn test_no_new_listings_means_no_median() {
        let listings = vec![stored_listing("o1", 1, dec!(30), "FIXED_PRICE", Some(at(2025, 5, 1, 0)))];
        let metric = aggregate_item(1, &listings, date(2025, 6, 1));
        assert_eq!(metric.new_priced_count(), 0);
        assert_eq!(metric.median_new_price, None);
    }

    #[tokio::test]
    async fn test_run_supply_is_idempotent() {
        let d = date(2025, 6, 1);
        let store = MemoryStore::with_items(vec![
            item(1, RefreshTier::Tier1, d),
            item(2, RefreshTier::Tier1, d),
        ]);
        store.add_listing(stored_listing("a", 1, dec!(20), "FIXED_PRICE", Some(at(2025, 6, 1, 1))));
        store.add_listing(stored_listing("b", 1, dec!(22), "FIXED_PRICE", Some(at(2025, 6, 1, 2))));
        store.add_listing(stored_listing("c", 2, dec!(9), "AUCTION", Some(at(2025, 5, 1, 2))));
        let mut ignored = stored_listing("d", 2, dec!(1), "FIXED_PRICE", Some(at(2025, 6, 1, 2)));
        ignored.is_ignored = true;
        store.add_listing(ignored);

        let first = run_supply(&store, d).await.unwrap();
        let rows_after_first = store.state().supply.clone();

        let second = run_supply(&store, d).await.unwrap();
        let rows_after_second = store.state().supply.clone();

        assert_eq!(first.rows_written, 2);
        assert_eq!(second.rows_written, 2);
        assert_eq!(rows_after_first, rows_after_second);
        assert_eq!(rows_after_second.len(), 2);

        let item2 = &rows_after_second[&(2, d)];
        assert_eq!(item2.new_fixed_price_only, 0);
        assert_eq!(item2.active_auction, 1);
        assert_eq!(rows_after_second[&(1, d)].median_new_price, Some(dec!(21)));
    }

    #[tokio::test]
    async fn test_run_supply_fails_when_store_unreachable() {
        let store = MemoryStore::new();
        store.state().unreachable = true;
        assert!(run_supply(&store, date(2025, 6, 1)).await.is_err());
    }
}
