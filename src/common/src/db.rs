//! Postgres pool for the pricing tables.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::debug;

use crate::Config;

/// Tables every pipeline stage reads or writes.
pub const REQUIRED_TABLES: [&str; 7] = [
    "inventory_items",
    "listings",
    "listing_price_changes",
    "daily_supply_metrics",
    "price_history",
    "daily_model_performance",
    "verified_sales",
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Missing tables (apply migrations/): {}", .0.join(", "))]
    MissingTables(Vec<String>),
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip the connection and confirm the pricing schema is in place.
    pub async fn health_check(&self) -> Result<(), DbError> {
        let mut missing = Vec::new();

        for table in REQUIRED_TABLES {
            let present: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
            if !present {
                missing.push(table.to_string());
            }
        }

        if !missing.is_empty() {
            return Err(DbError::MissingTables(missing));
        }

        debug!("All {} pricing tables present", REQUIRED_TABLES.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tables_message() {
        let err = DbError::MissingTables(vec!["listings".to_string(), "verified_sales".to_string()]);
        assert_eq!(
            err.to_string(),
            "Missing tables (apply migrations/): listings, verified_sales"
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a migrated Postgres"]
    async fn test_health_check_against_live_database() {
        let config = Config::from_env().expect("Config should load");
        let db = Database::connect(&config).await.expect("Should connect");
        db.health_check().await.expect("Schema should be complete");
    }
}
