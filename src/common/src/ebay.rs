//! eBay Browse API client for active listing searches.
//!
//! Uses the `item_summary/search` endpoint, by catalog product id (`epid`)
//! when the item has one and by keywords otherwise.
//! See: https://developer.ebay.com/api-docs/buy/browse/resources/item_summary/methods/search

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::models::{ListingPage, ListingQuery, RawListing};
use crate::Config;

/// Largest page the search endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum EbayError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Rate limited by marketplace")]
    RateLimited,

    #[error("API returned status: {0}")]
    StatusError(u16),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No EBAY_ACCESS_TOKEN configured")]
    MissingToken,
}

impl EbayError {
    /// Whether the request gave up waiting on the marketplace.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EbayError::RequestError(e) if e.is_timeout())
    }
}

/// Search response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// URL of the following page, absent on the last page
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub item_id: Option<String>,
    pub title: Option<String>,
    pub price: Option<Amount>,
    #[serde(default)]
    pub buying_options: Vec<String>,
    pub item_location: Option<ItemLocation>,
    pub item_creation_date: Option<String>,
    pub item_origin_date: Option<String>,
    pub item_end_date: Option<String>,
    pub epid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Amount {
    pub value: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemLocation {
    pub country: Option<String>,
}

impl ItemSummary {
    fn into_raw(self) -> RawListing {
        let (price, currency) = match self.price {
            Some(amount) => (amount.value, amount.currency),
            None => (None, None),
        };

        // The origin date survives relists; the creation date is the fallback.
        let start_date = self
            .item_origin_date
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.item_creation_date.as_deref().and_then(parse_timestamp));

        RawListing {
            external_id: self.item_id.filter(|id| !id.trim().is_empty()),
            title: self.title,
            price,
            currency,
            buying_options: self.buying_options,
            location_country: self.item_location.and_then(|l| l.country),
            start_date,
            end_date: self.item_end_date.as_deref().and_then(parse_timestamp),
            epid: self.epid.filter(|e| !e.trim().is_empty()),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decode a search response body into a provider page.
pub fn parse_search_response(body: &str, requested_offset: u32) -> Result<ListingPage, EbayError> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|e| EbayError::ParseError(e.to_string()))?;

    let offset = response.offset.unwrap_or(requested_offset);
    let returned = response.item_summaries.len() as u32;
    let step = response.limit.unwrap_or(returned).max(returned);

    let next_offset = match (&response.next, returned) {
        (Some(_), n) if n > 0 => Some(offset + step),
        _ => None,
    };

    Ok(ListingPage {
        records: response
            .item_summaries
            .into_iter()
            .map(ItemSummary::into_raw)
            .collect(),
        next_offset,
    })
}

/// Browse API client.
pub struct EbayClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
    marketplace_id: String,
    page_size: u32,
    currency: String,
    request_timeout: Duration,
}

impl EbayClient {
    /// Create a new Browse API client.
    pub fn new(
        config: &Config,
        request_timeout: Duration,
        page_size: u32,
        currency: &str,
    ) -> Result<Self, EbayError> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base_url: config.ebay_api_url.clone(),
            access_token: config.ebay_access_token.clone(),
            marketplace_id: config.ebay_marketplace_id.clone(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            currency: currency.to_string(),
            request_timeout,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Query string for one search page.
    pub fn search_params(&self, query: &ListingQuery, offset: u32) -> Vec<(&'static str, String)> {
        let mut params = match query {
            ListingQuery::Catalog(epid) => vec![("epid", epid.clone())],
            ListingQuery::Keywords(q) => vec![("q", q.clone())],
        };
        params.push(("limit", self.page_size.to_string()));
        params.push(("offset", offset.to_string()));
        params.push(("sort", "newlyListed".to_string()));
        params.push(("filter", format!("priceCurrency:{}", self.currency)));
        params
    }

    /// Fetch one page of active listings.
    pub async fn search(&self, query: &ListingQuery, offset: u32) -> Result<ListingPage, EbayError> {
        let token = self.access_token.as_deref().ok_or(EbayError::MissingToken)?;
        let url = format!("{}/item_summary/search", self.base_url);

        debug!("Searching {:?} at offset {}", query, offset);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.marketplace_id)
            .query(&self.search_params(query, offset))
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(EbayError::RateLimited),
            status if !status.is_success() => return Err(EbayError::StatusError(status.as_u16())),
            _ => {}
        }

        let body = response.text().await?;
        let page = parse_search_response(&body, offset)?;
        debug!("Fetched {} listings at offset {}", page.records.len(), offset);
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "href": "https://api.ebay.com/buy/browse/v1/item_summary/search?q=maye&limit=2&offset=0",
        "total": 5,
        "next": "https://api.ebay.com/buy/browse/v1/item_summary/search?q=maye&limit=2&offset=2",
        "limit": 2,
        "offset": 0,
        "itemSummaries": [
            {
                "itemId": "v1|1234|0",
                "title": "2024 Donruss Downtown Drake Maye PSA 10",
                "price": { "value": "249.99", "currency": "USD" },
                "buyingOptions": ["FIXED_PRICE", "BEST_OFFER"],
                "itemLocation": { "country": "US" },
                "itemCreationDate": "2025-06-02T10:00:00.000Z",
                "itemOriginDate": "2025-05-30T08:00:00.000Z",
                "itemEndDate": "2025-07-02T10:00:00.000Z",
                "epid": "24051234"
            },
            {
                "title": "Drake Maye Downtown no id",
                "price": { "value": "not-a-price", "currency": "USD" }
            }
        ]
    }"#;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_string(),
            ebay_api_url: "https://api.ebay.com/buy/browse/v1".to_string(),
            ebay_access_token: None,
            ebay_marketplace_id: "EBAY_US".to_string(),
        }
    }

    #[test]
    fn test_parse_search_response() {
        let page = parse_search_response(SAMPLE, 0).unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_offset, Some(2));

        let first = &page.records[0];
        assert_eq!(first.external_id.as_deref(), Some("v1|1234|0"));
        assert_eq!(first.price.as_deref(), Some("249.99"));
        assert_eq!(first.buying_options, vec!["FIXED_PRICE", "BEST_OFFER"]);
        assert_eq!(first.location_country.as_deref(), Some("US"));
        // Origin date wins over creation date
        assert_eq!(
            first.start_date.unwrap().to_rfc3339(),
            "2025-05-30T08:00:00+00:00"
        );

        assert_eq!(first.epid.as_deref(), Some("24051234"));

        assert!(page.records[1].external_id.is_none());
        assert!(page.records[1].epid.is_none());
    }

    #[test]
    fn test_parse_last_page() {
        let body = r#"{"total": 1, "offset": 0, "limit": 200, "itemSummaries": [
            {"itemId": "v1|1|0", "price": {"value": "5.00", "currency": "USD"}}
        ]}"#;
        let page = parse_search_response(body, 0).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_offset, None);
    }

    #[test]
    fn test_parse_empty_response() {
        let page = parse_search_response(r#"{"total": 0}"#, 400).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next_offset, None);
    }

    #[test]
    fn test_parse_invalid_body() {
        let result = parse_search_response("<html>oops</html>", 0);
        assert!(matches!(result, Err(EbayError::ParseError(_))));
    }

    #[test]
    fn test_search_params() {
        let client = EbayClient::new(&config(), Duration::from_secs(30), 500, "USD").unwrap();

        let params = client.search_params(&ListingQuery::Catalog("99887766".to_string()), 200);
        assert!(params.contains(&("epid", "99887766".to_string())));
        assert!(params.contains(&("limit", "200".to_string())));
        assert!(params.contains(&("offset", "200".to_string())));
        assert!(params.contains(&("filter", "priceCurrency:USD".to_string())));

        let params = client.search_params(&ListingQuery::Keywords("maye psa 10".to_string()), 0);
        assert!(params.contains(&("q", "maye psa 10".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "epid"));
    }

    #[tokio::test]
    async fn test_search_without_token() {
        let client = EbayClient::new(&config(), Duration::from_secs(30), 200, "USD").unwrap();
        assert!(!client.has_credentials());

        let result = client
            .search(&ListingQuery::Keywords("maye".to_string()), 0)
            .await;
        assert!(matches!(result, Err(EbayError::MissingToken)));
    }
}
