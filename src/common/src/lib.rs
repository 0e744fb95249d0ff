//! Common library for the cardpulse pricing services.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling and repository queries
//! - eBay Browse listings client
//! - Shared data models and title classifiers

pub mod classify;
pub mod config;
pub mod db;
pub mod ebay;
pub mod models;
pub mod repository;

pub use config::Config;
pub use db::Database;
pub use ebay::{EbayClient, EbayError};
pub use models::{
    BuyingOption, CatalogBackfill, DailySupplyMetric, EstimateOutcome, InventoryItem, ListingChangeSet,
    ListingPage, ListingPriceChange, ListingQuery, ModelPerformanceSnapshot, NewListing,
    PriceEstimate, RawListing, RefreshTier, SeenListing, SignalStrength, StoredListing,
    ValueSignal, VerifiedSale,
};
