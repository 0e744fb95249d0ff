//! Database repository functions for items, listings, supply and pricing.
//!
//! Every write is keyed by a natural key so a rerun overwrites instead of
//! duplicating. Queries are runtime-checked (`sqlx::query*` with `bind`).

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::models::{
    DailySupplyMetric, EstimateOutcome, InventoryItem, ListingChangeSet,
    ModelPerformanceSnapshot, NewListing, PriceEstimate, RefreshTier, StoredListing, ValueSignal,
    VerifiedSale,
};

const ITEM_COLUMNS: &str = r#"
    id, player_name, year, set_name, subset, card_number, parallel,
    grader, grade, catalog_id, refresh_tier, next_refresh_due, last_refreshed_at
"#;

const LISTING_COLUMNS: &str = r#"
    external_id, item_id, title, price, currency, buying_options,
    start_date, end_date, is_active, is_ignored,
    first_seen_at, last_seen_at, disappeared_at
"#;

// ---------------------------------------------------------------------------
// Inventory items
// ---------------------------------------------------------------------------

/// Get every tracked item.
pub async fn get_items(pool: &PgPool) -> Result<Vec<InventoryItem>, sqlx::Error> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM inventory_items ORDER BY id");
    sqlx::query_as::<_, InventoryItem>(&sql).fetch_all(pool).await
}

/// Get items due on or before `today`, most urgent tier first, oldest due
/// date first within a tier.
pub async fn get_due_items(
    pool: &PgPool,
    today: NaiveDate,
    limit: i64,
) -> Result<Vec<InventoryItem>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {ITEM_COLUMNS}
        FROM inventory_items
        WHERE next_refresh_due <= $1
        ORDER BY refresh_tier ASC, next_refresh_due ASC, id ASC
        LIMIT $2
        "#
    );

    sqlx::query_as::<_, InventoryItem>(&sql)
        .bind(today)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Latest persisted value estimate (for `model_version`) and latest
/// non-auction active volume for every item, both as of `as_of`.
pub async fn get_value_signals(
    pool: &PgPool,
    as_of: NaiveDate,
    model_version: &str,
) -> Result<Vec<ValueSignal>, sqlx::Error> {
    sqlx::query_as::<_, ValueSignal>(
        r#"
        SELECT
            i.id AS item_id,
            (
                SELECT ph.estimated_market_value
                FROM price_history ph
                WHERE ph.item_id = i.id
                  AND ph.model_version = $2
                  AND ph.date <= $1
                ORDER BY ph.date DESC
                LIMIT 1
            ) AS latest_value,
            (
                SELECT (s.active_fixed_price_only + s.active_best_offer)::BIGINT
                FROM daily_supply_metrics s
                WHERE s.item_id = i.id
                  AND s.date <= $1
                ORDER BY s.date DESC
                LIMIT 1
            ) AS latest_volume
        FROM inventory_items i
        ORDER BY i.id
        "#,
    )
    .bind(as_of)
    .bind(model_version)
    .fetch_all(pool)
    .await
}

/// Write an item's tier and next due date.
pub async fn update_item_schedule(
    pool: &PgPool,
    item_id: i64,
    tier: RefreshTier,
    next_due: NaiveDate,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE inventory_items
        SET refresh_tier = $2, next_refresh_due = $3
        WHERE id = $1
        "#,
    )
    .bind(item_id)
    .bind(tier.as_i16())
    .bind(next_due)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Get the recorded active listing set of one item.
pub async fn get_active_listings_for_item(
    pool: &PgPool,
    item_id: i64,
) -> Result<Vec<StoredListing>, sqlx::Error> {
    let sql = format!(
        "SELECT {LISTING_COLUMNS} FROM listings WHERE item_id = $1 AND is_active = true"
    );

    sqlx::query_as::<_, StoredListing>(&sql)
        .bind(item_id)
        .fetch_all(pool)
        .await
}

/// Get every non-ignored, item-linked listing, active or not.
pub async fn get_supply_listings(pool: &PgPool) -> Result<Vec<StoredListing>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {LISTING_COLUMNS}
        FROM listings
        WHERE item_id IS NOT NULL AND is_ignored = false
        ORDER BY item_id, external_id
        "#
    );

    sqlx::query_as::<_, StoredListing>(&sql).fetch_all(pool).await
}

/// Get currently active, non-ignored, item-linked listings (floor candidates).
pub async fn get_active_priced_listings(
    pool: &PgPool,
) -> Result<Vec<StoredListing>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {LISTING_COLUMNS}
        FROM listings
        WHERE item_id IS NOT NULL AND is_active = true AND is_ignored = false
        ORDER BY item_id, external_id
        "#
    );

    sqlx::query_as::<_, StoredListing>(&sql).fetch_all(pool).await
}

/// Apply one item's reconciliation in a single transaction and advance its
/// refresh schedule. Nothing is written if any statement fails.
pub async fn apply_listing_changes(
    pool: &PgPool,
    changes: &ListingChangeSet,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for listing in &changes.inserts {
        upsert_listing(&mut tx, listing, changes.observed_at).await?;
    }

    for seen in &changes.seen {
        sqlx::query(
            r#"
            UPDATE listings
            SET last_seen_at = $2, price = COALESCE($3, price)
            WHERE external_id = $1
            "#,
        )
        .bind(&seen.external_id)
        .bind(changes.observed_at)
        .bind(seen.price)
        .execute(&mut *tx)
        .await?;
    }

    for change in &changes.price_changes {
        insert_price_change(
            &mut tx,
            &change.external_id,
            change.old_price,
            change.new_price,
            change.changed_at,
        )
        .await?;
    }

    if !changes.disappeared.is_empty() {
        sqlx::query(
            r#"
            UPDATE listings
            SET is_active = false, disappeared_at = $2
            WHERE external_id = ANY($1) AND is_active = true
            "#,
        )
        .bind(&changes.disappeared)
        .bind(changes.observed_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE inventory_items
        SET refresh_tier = $2, next_refresh_due = $3, last_refreshed_at = $4
        WHERE id = $1
        "#,
    )
    .bind(changes.item_id)
    .bind(changes.refresh_tier.as_i16())
    .bind(changes.next_refresh_due)
    .bind(changes.observed_at)
    .execute(&mut *tx)
    .await?;

    if let Some(backfill) = &changes.catalog_backfill {
        sqlx::query(
            r#"
            UPDATE inventory_items
            SET catalog_id = $1
            WHERE id = ANY($2) AND (catalog_id IS NULL OR btrim(catalog_id) = '')
            "#,
        )
        .bind(&backfill.catalog_id)
        .bind(&backfill.item_ids)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Insert a new listing, or reactivate a previously stored one (relist).
/// A relist at a different price also appends a price change. A stored
/// listing keeps its item; it is never moved to another grade variant.
async fn upsert_listing(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    listing: &NewListing,
    observed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let previous: Option<Decimal> =
        sqlx::query_scalar("SELECT price FROM listings WHERE external_id = $1 FOR UPDATE")
            .bind(&listing.external_id)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some(old_price) = previous {
        if old_price != listing.price {
            insert_price_change(tx, &listing.external_id, old_price, listing.price, observed_at)
                .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO listings (
            external_id, item_id, title, price, currency, buying_options,
            location_country, start_date, end_date, is_active, is_ignored,
            first_seen_at, last_seen_at, disappeared_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, true, $10, $11, $11, NULL)
        ON CONFLICT (external_id) DO UPDATE SET
            item_id = COALESCE(listings.item_id, EXCLUDED.item_id),
            title = EXCLUDED.title,
            price = EXCLUDED.price,
            currency = EXCLUDED.currency,
            buying_options = EXCLUDED.buying_options,
            location_country = EXCLUDED.location_country,
            start_date = EXCLUDED.start_date,
            end_date = EXCLUDED.end_date,
            is_active = true,
            is_ignored = CASE
                WHEN listings.item_id IS NULL OR listings.item_id = EXCLUDED.item_id
                THEN EXCLUDED.is_ignored
                ELSE listings.is_ignored
            END,
            last_seen_at = EXCLUDED.last_seen_at,
            disappeared_at = NULL
        "#,
    )
    .bind(&listing.external_id)
    .bind(listing.item_id)
    .bind(&listing.title)
    .bind(listing.price)
    .bind(&listing.currency)
    .bind(&listing.buying_options)
    .bind(&listing.location_country)
    .bind(listing.start_date)
    .bind(listing.end_date)
    .bind(listing.is_ignored)
    .bind(observed_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_price_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    external_id: &str,
    old_price: Decimal,
    new_price: Decimal,
    changed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO listing_price_changes (external_id, old_price, new_price, changed_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(external_id)
    .bind(old_price)
    .bind(new_price)
    .bind(changed_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Supply metrics
// ---------------------------------------------------------------------------

/// Insert or overwrite the supply row for (item, date).
pub async fn upsert_daily_supply(
    pool: &PgPool,
    metric: &DailySupplyMetric,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO daily_supply_metrics (
            item_id, date,
            new_fixed_price_only, new_best_offer, new_auction, new_unknown,
            active_fixed_price_only, active_best_offer, active_auction, active_unknown,
            median_new_price, computed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
        ON CONFLICT (item_id, date) DO UPDATE SET
            new_fixed_price_only = EXCLUDED.new_fixed_price_only,
            new_best_offer = EXCLUDED.new_best_offer,
            new_auction = EXCLUDED.new_auction,
            new_unknown = EXCLUDED.new_unknown,
            active_fixed_price_only = EXCLUDED.active_fixed_price_only,
            active_best_offer = EXCLUDED.active_best_offer,
            active_auction = EXCLUDED.active_auction,
            active_unknown = EXCLUDED.active_unknown,
            median_new_price = EXCLUDED.median_new_price,
            computed_at = NOW()
        "#,
    )
    .bind(metric.item_id)
    .bind(metric.date)
    .bind(metric.new_fixed_price_only)
    .bind(metric.new_best_offer)
    .bind(metric.new_auction)
    .bind(metric.new_unknown)
    .bind(metric.active_fixed_price_only)
    .bind(metric.active_best_offer)
    .bind(metric.active_auction)
    .bind(metric.active_unknown)
    .bind(metric.median_new_price)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get supply rows for all items with `from <= date <= to`.
pub async fn get_supply_history(
    pool: &PgPool,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailySupplyMetric>, sqlx::Error> {
    sqlx::query_as::<_, DailySupplyMetric>(
        r#"
        SELECT
            item_id, date,
            new_fixed_price_only, new_best_offer, new_auction, new_unknown,
            active_fixed_price_only, active_best_offer, active_auction, active_unknown,
            median_new_price
        FROM daily_supply_metrics
        WHERE date BETWEEN $1 AND $2
        ORDER BY item_id, date
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

/// Insert or overwrite the estimate columns of (item, date, model_version).
/// Validation columns of an existing row are left alone.
pub async fn upsert_price_estimate(
    pool: &PgPool,
    estimate: &PriceEstimate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO price_history (
            item_id, date, model_version, estimated_market_value,
            driving_factor, signal_strength, shock_multiplier, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (item_id, date, model_version) DO UPDATE SET
            estimated_market_value = EXCLUDED.estimated_market_value,
            driving_factor = EXCLUDED.driving_factor,
            signal_strength = EXCLUDED.signal_strength,
            shock_multiplier = EXCLUDED.shock_multiplier,
            updated_at = NOW()
        "#,
    )
    .bind(estimate.item_id)
    .bind(estimate.date)
    .bind(&estimate.model_version)
    .bind(estimate.estimated_market_value)
    .bind(&estimate.driving_factor)
    .bind(estimate.signal_strength.as_str())
    .bind(estimate.shock_multiplier)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get all estimates of one model version dated on or before `through`.
pub async fn get_price_estimates(
    pool: &PgPool,
    model_version: &str,
    through: NaiveDate,
) -> Result<Vec<PriceEstimate>, sqlx::Error> {
    sqlx::query_as::<_, PriceEstimate>(
        r#"
        SELECT
            item_id, date, model_version, estimated_market_value,
            driving_factor, signal_strength, shock_multiplier,
            actual_sold_price, error_pct
        FROM price_history
        WHERE model_version = $1 AND date <= $2
        ORDER BY item_id, date
        "#,
    )
    .bind(model_version)
    .bind(through)
    .fetch_all(pool)
    .await
}

/// Write a verified outcome onto an existing estimate row. Never inserts.
pub async fn record_estimate_outcome(
    pool: &PgPool,
    outcome: &EstimateOutcome,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE price_history
        SET actual_sold_price = $4, error_pct = $5, updated_at = NOW()
        WHERE item_id = $1 AND date = $2 AND model_version = $3
        "#,
    )
    .bind(outcome.item_id)
    .bind(outcome.date)
    .bind(&outcome.model_version)
    .bind(outcome.actual_sold_price)
    .bind(outcome.error_pct)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Get verified sales sold on or before `through`.
pub async fn get_verified_sales(
    pool: &PgPool,
    through: NaiveDate,
) -> Result<Vec<VerifiedSale>, sqlx::Error> {
    sqlx::query_as::<_, VerifiedSale>(
        r#"
        SELECT item_id, sold_date, price
        FROM verified_sales
        WHERE sold_date <= $1
        ORDER BY item_id, sold_date
        "#,
    )
    .bind(through)
    .fetch_all(pool)
    .await
}

/// Insert or overwrite the performance snapshot for (date, model_version).
pub async fn upsert_model_performance(
    pool: &PgPool,
    snapshot: &ModelPerformanceSnapshot,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO daily_model_performance (
            date, model_version, rmse, mae, bias, mape, hit_rate, sample_count, computed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (date, model_version) DO UPDATE SET
            rmse = EXCLUDED.rmse,
            mae = EXCLUDED.mae,
            bias = EXCLUDED.bias,
            mape = EXCLUDED.mape,
            hit_rate = EXCLUDED.hit_rate,
            sample_count = EXCLUDED.sample_count,
            computed_at = NOW()
        "#,
    )
    .bind(snapshot.date)
    .bind(&snapshot.model_version)
    .bind(snapshot.rmse)
    .bind(snapshot.mae)
    .bind(snapshot.bias)
    .bind(snapshot.mape)
    .bind(snapshot.hit_rate)
    .bind(snapshot.sample_count)
    .execute(pool)
    .await?;

    Ok(())
}
