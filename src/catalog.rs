use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::domain::{CollectionId, ProductDescriptor, ProductId, TimeRange};
use crate::error::IngestError;

/// Page size for OpenSearch requests.
const PAGE_SIZE: usize = 100;

/// Margin kept on the token expiration date to anticipate renewal.
const TOKEN_REFRESH_MARGIN: chrono::Duration = chrono::Duration::minutes(5);

pub trait CatalogClient: Send + Sync {
    /// Query the remote catalog for products in `range`, ascending by
    /// sensing start time. Failures are fatal and never retried here: a
    /// failed search is not safely retryable without risking a partial
    /// result set.
    fn search(
        &self,
        collection: &CollectionId,
        range: &TimeRange,
    ) -> Result<Vec<ProductDescriptor>, IngestError>;
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges the consumer key/secret for a bearer token and caches it until
/// it comes within the refresh margin of expiry. Shared between the catalog
/// client and the product downloader.
pub struct TokenProvider {
    client: Client,
    token_url: String,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, IngestError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        Ok(Self {
            client,
            token_url: format!("{base_url}/token"),
            credentials,
            token: Mutex::new(None),
        })
    }

    pub fn bearer_token(&self) -> Result<String, IngestError> {
        let refresh_after = Utc::now() + TOKEN_REFRESH_MARGIN;
        let mut guard = self
            .token
            .lock()
            .map_err(|_| IngestError::AuthHttp("token cache poisoned".to_string()))?;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > refresh_after {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(
                &self.credentials.consumer_key,
                Some(&self.credentials.consumer_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "token request failed".to_string());
            return Err(IngestError::AuthStatus { status, message });
        }
        let payload: TokenResponse = response
            .json()
            .map_err(|err| IngestError::AuthHttp(err.to_string()))?;
        let expires_at = Utc::now() + chrono::Duration::seconds(payload.expires_in);
        debug!(expires_at = %expires_at, "refreshed API token");
        let token = payload.access_token.clone();
        *guard = Some(CachedToken {
            access_token: payload.access_token,
            expires_at,
        });
        Ok(token)
    }
}

pub struct HttpCatalogClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str, tokens: Arc<TokenProvider>) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sral-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| IngestError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            tokens,
        })
    }

    fn search_page(
        &self,
        collection: &CollectionId,
        range: &TimeRange,
        start_index: usize,
    ) -> Result<SearchPage, IngestError> {
        let query = format_query(&[
            ("format", "json".to_string()),
            ("pi", collection.as_str().to_string()),
            (
                "dtstart",
                range.start().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "dtend",
                range.end().to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("si", start_index.to_string()),
            ("c", PAGE_SIZE.to_string()),
        ]);
        let url = format!("{}/data/search-products/1.0.0/os?{query}", self.base_url);
        debug!(%url, "catalog page request");

        let token = self.tokens.bearer_token()?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .map_err(|err| IngestError::CatalogHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(IngestError::CatalogStatus { status, message });
        }
        response
            .json()
            .map_err(|err| IngestError::CatalogPayload(err.to_string()))
    }
}

impl CatalogClient for HttpCatalogClient {
    fn search(
        &self,
        collection: &CollectionId,
        range: &TimeRange,
    ) -> Result<Vec<ProductDescriptor>, IngestError> {
        let mut descriptors = Vec::new();
        let mut start_index = 0usize;
        loop {
            let page = self.search_page(collection, range, start_index)?;
            let total = page.properties.total_results;
            let count = page.features.len();
            for feature in page.features {
                descriptors.push(parse_feature(feature)?);
            }
            start_index += count;
            if count == 0 || start_index >= total {
                break;
            }
        }
        let matched = descriptors.len();
        let descriptors = filter_to_range(descriptors, range);
        if descriptors.len() < matched {
            debug!(
                dropped = matched - descriptors.len(),
                "dropped products sensed outside the requested range"
            );
        }
        info!(
            collection = %collection,
            products = descriptors.len(),
            "catalog search complete"
        );
        Ok(sorted_by_sensing_start(descriptors))
    }
}

/// Ampersand-joined `key=value` pairs, the OpenSearch query convention the
/// catalog expects. Values are passed through verbatim.
pub fn format_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// The remote `dtstart`/`dtend` filter matches by sensing-interval overlap,
/// so a product straddling the window boundary comes back with a sensing
/// start outside it. Callers are promised `sensing_start` within the range.
pub fn filter_to_range(
    descriptors: Vec<ProductDescriptor>,
    range: &TimeRange,
) -> Vec<ProductDescriptor> {
    descriptors
        .into_iter()
        .filter(|descriptor| range.contains(descriptor.sensing_start))
        .collect()
}

/// The catalog's native ordering is not trusted; downstream assembly order
/// depends on ascending sensing time.
pub fn sorted_by_sensing_start(mut descriptors: Vec<ProductDescriptor>) -> Vec<ProductDescriptor> {
    descriptors.sort_by_key(|descriptor| descriptor.sensing_start);
    descriptors
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    properties: PageProperties,
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct PageProperties {
    #[serde(rename = "totalResults")]
    total_results: usize,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    identifier: String,
    #[serde(default)]
    title: Option<String>,
    date: String,
}

fn parse_feature(feature: Feature) -> Result<ProductDescriptor, IngestError> {
    let properties = feature.properties;
    let id: ProductId = properties.identifier.parse()?;
    // `date` is "sensing-start/sensing-end".
    let start_text = properties.date.split('/').next().ok_or_else(|| {
        IngestError::CatalogPayload(format!("bad date field: {}", properties.date))
    })?;
    let sensing_start = DateTime::parse_from_rfc3339(start_text)
        .map_err(|_| IngestError::CatalogPayload(format!("bad sensing date: {start_text}")))?
        .with_timezone(&Utc);
    let title = properties.title.unwrap_or_else(|| id.as_str().to_string());
    Ok(ProductDescriptor {
        id,
        sensing_start,
        title,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn query_formatting_joins_pairs() {
        let query = format_query(&[
            ("format", "json".to_string()),
            ("pi", "EO:EUM:DAT:0415".to_string()),
            ("dtstart", "2024-09-23T00:20:00Z".to_string()),
        ]);
        assert_eq!(
            query,
            "format=json&pi=EO:EUM:DAT:0415&dtstart=2024-09-23T00:20:00Z"
        );
    }

    fn make(name: &str, hour: u32) -> ProductDescriptor {
        ProductDescriptor {
            id: name.parse().unwrap(),
            sensing_start: Utc.with_ymd_and_hms(2024, 9, 23, hour, 0, 0).unwrap(),
            title: name.to_string(),
        }
    }

    #[test]
    fn descriptors_sorted_ascending() {
        let sorted = sorted_by_sensing_start(vec![make("b", 12), make("a", 3), make("c", 20)]);
        let names: Vec<_> = sorted.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn boundary_straddling_products_are_filtered_out() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 9, 23, 4, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 9, 23, 12, 0, 0).unwrap(),
        )
        .unwrap();

        // The remote overlap filter would return all four; only products
        // sensed inside the window may survive.
        let kept = filter_to_range(
            vec![make("before", 3), make("at-start", 4), make("inside", 8), make("after", 13)],
            &range,
        );
        let names: Vec<_> = kept.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["at-start", "inside"]);
        assert!(kept.iter().all(|d| range.contains(d.sensing_start)));
    }

    #[test]
    fn feature_parsing_splits_date_interval() {
        let feature = Feature {
            properties: FeatureProperties {
                identifier: "S3A_SR_2_LAN_20240923".to_string(),
                title: None,
                date: "2024-09-23T01:02:03Z/2024-09-23T01:50:00Z".to_string(),
            },
        };
        let descriptor = parse_feature(feature).unwrap();
        assert_eq!(
            descriptor.sensing_start,
            Utc.with_ymd_and_hms(2024, 9, 23, 1, 2, 3).unwrap()
        );
        assert_eq!(descriptor.title, "S3A_SR_2_LAN_20240923");
    }
}
