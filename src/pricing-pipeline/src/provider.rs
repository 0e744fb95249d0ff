//! Marketplace listings provider seam.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use common::{EbayClient, EbayError, ListingPage, ListingQuery};

/// Transient failure fetching listings for one item. The item is skipped
/// and its schedule is left untouched so the next pass retries it.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by marketplace")]
    RateLimited,

    #[error("marketplace returned status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("no marketplace credentials configured")]
    Unauthorized,

    #[error("per-pass call budget exhausted")]
    BudgetExhausted,
}

impl FetchError {
    /// Map a client error, reporting timeouts with the client's configured limit.
    pub fn from_ebay(err: EbayError, request_timeout: Duration) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout(request_timeout);
        }
        match err {
            EbayError::RateLimited => FetchError::RateLimited,
            EbayError::StatusError(code) => FetchError::Status(code),
            EbayError::ParseError(msg) => FetchError::Decode(msg),
            EbayError::MissingToken => FetchError::Unauthorized,
            EbayError::RequestError(e) => FetchError::Transport(e.to_string()),
        }
    }
}

/// Source of currently active marketplace listings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingsProvider: Send + Sync {
    /// Fetch one page of active listings starting at `offset`.
    async fn fetch_page(&self, query: &ListingQuery, offset: u32)
        -> Result<ListingPage, FetchError>;
}

#[async_trait]
impl ListingsProvider for EbayClient {
    async fn fetch_page(
        &self,
        query: &ListingQuery,
        offset: u32,
    ) -> Result<ListingPage, FetchError> {
        self.search(query, offset)
            .await
            .map_err(|e| FetchError::from_ebay(e, self.request_timeout()))
    }
}
