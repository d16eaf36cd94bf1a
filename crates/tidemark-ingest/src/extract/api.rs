//! Paginated JSON API extraction
//!
//! Pages look like `{"page": 1, "results": [...], "total_pages": 12}`.
//! Rate limiting (HTTP 429) is honoured by waiting `Retry-After` seconds.

use super::Extractor;
use crate::batch::RowBatch;
use crate::error::BatchError;
use crate::job::JobSettings;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tidemark_common::Bookmark;
use tracing::{error, info, warn};

// ============================================================================
// Client Constants
// ============================================================================

pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

/// Wait used when a 429 response carries no usable `Retry-After`
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

/// Pause between pages; keeps under 40 requests per 10 seconds
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(250);

pub const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 5;

pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Error fetching {url}: {status} - {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Still rate limited on {url} after {retries} retries")]
    RateLimited { url: String, retries: u32 },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<Record>,
    #[serde(default)]
    total_pages: u32,
}

/// Bearer-authenticated client for a paginated API
#[derive(Debug, Clone)]
pub struct PagedApiClient {
    client: Client,
    base_url: String,
    token: String,
    page_delay: Duration,
    max_rate_limit_retries: u32,
    dump_dir: Option<PathBuf>,
}

impl PagedApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_API_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            page_delay: DEFAULT_PAGE_DELAY,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            dump_dir: None,
        })
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_max_rate_limit_retries(mut self, retries: u32) -> Self {
        self.max_rate_limit_retries = retries;
        self
    }

    /// On failure, save records fetched so far as JSON under `dir`
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        page: u32,
    ) -> Result<Page, ExtractError> {
        let url = self.url(endpoint);
        let mut retries = 0;

        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header(header::ACCEPT, "application/json")
                .query(params)
                .query(&[("page", page)])
                .send()
                .await?;

            match response.status() {
                StatusCode::OK => return Ok(response.json().await?),
                StatusCode::TOO_MANY_REQUESTS => {
                    if retries >= self.max_rate_limit_retries {
                        return Err(ExtractError::RateLimited { url, retries });
                    }
                    retries += 1;

                    let wait = response
                        .headers()
                        .get(header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    warn!(url = %url, page, wait_secs = wait, "Rate limit hit, waiting");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                },
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ExtractError::Status {
                        url,
                        status: status.as_u16(),
                        body,
                    });
                },
            }
        }
    }

    /// Every record from `start_page` on
    ///
    /// Stops at the first empty page, after `max_pages` pages (0 or `None`
    /// means no cap), or at the last page the API reports.
    pub async fn fetch_all(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        start_page: u32,
        max_pages: Option<u32>,
    ) -> Result<Vec<Record>, ExtractError> {
        let max_pages = max_pages.filter(|&m| m > 0);
        let mut records = Vec::new();
        let mut page = start_page;

        info!(endpoint, ?params, "Fetching API pages");

        loop {
            let fetched = match self.fetch_page(endpoint, params, page).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    error!(endpoint, page, error = %e, "Page fetch failed");
                    self.dump_partial(endpoint, &records)?;
                    return Err(e);
                },
            };

            if fetched.results.is_empty() {
                info!(page, "No results, stopping pagination");
                break;
            }

            let count = fetched.results.len();
            records.extend(fetched.results);
            info!(page, count, total_pages = fetched.total_pages, "Fetched page");

            let capped = max_pages.is_some_and(|max| page >= max);
            if capped || page >= fetched.total_pages {
                break;
            }

            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(records)
    }

    fn dump_partial(&self, endpoint: &str, records: &[Record]) -> Result<(), ExtractError> {
        let Some(dir) = &self.dump_dir else {
            return Ok(());
        };

        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_temp_data.json", endpoint.replace('/', "_")));
        std::fs::write(&path, serde_json::to_string_pretty(records)?)?;

        info!(path = %path.display(), records = records.len(), "Saved partial results");
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Settings for one API ingestion job
#[derive(Debug, Clone, Deserialize)]
pub struct ApiJobConfig {
    pub table_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub primary_keys: Vec<String>,
    pub range_column: String,
    /// Path under the client's base URL, e.g. `discover/movie`
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Query parameter carrying the bookmark lower bound
    #[serde(default)]
    pub bookmark_param: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl JobSettings for ApiJobConfig {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    fn range_column(&self) -> &str {
        &self.range_column
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }
}

pub struct ApiExtractor {
    client: PagedApiClient,
    endpoint: String,
    params: BTreeMap<String, String>,
    bookmark_param: Option<String>,
}

impl ApiExtractor {
    pub fn new(client: PagedApiClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            bookmark_param: None,
        }
    }

    pub fn from_config(client: PagedApiClient, config: &ApiJobConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            params: config.params.clone(),
            bookmark_param: config.bookmark_param.clone(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_bookmark_param(mut self, name: impl Into<String>) -> Self {
        self.bookmark_param = Some(name.into());
        self
    }

    /// Query parameters for a run starting at `bookmark`
    fn params_for(&self, bookmark: Option<&Bookmark>) -> BTreeMap<String, String> {
        let mut params = self.params.clone();
        if let (Some(name), Some(bookmark)) = (&self.bookmark_param, bookmark) {
            let bound = match bookmark {
                Bookmark::Timestamp(ts) => ts.date_naive().to_string(),
                Bookmark::Sequence(n) => n.to_string(),
            };
            params.insert(name.clone(), bound);
        }
        params
    }
}

#[async_trait]
impl Extractor for ApiExtractor {
    async fn extract(
        &self,
        bookmark: Option<&Bookmark>,
        max_pages: Option<u32>,
    ) -> anyhow::Result<Option<RowBatch>> {
        let params = self.params_for(bookmark);
        let records = self
            .client
            .fetch_all(&self.endpoint, &params, 1, max_pages)
            .await?;

        if records.is_empty() {
            return Ok(None);
        }

        let batch = RowBatch::from_json_records(&records).map_err(ExtractError::from)?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_params_for_bookmark() {
        let client = PagedApiClient::new("http://localhost", "token").unwrap();
        let extractor = ApiExtractor::new(client, "discover/movie")
            .with_param("sort_by", "primary_release_date")
            .with_bookmark_param("release_date.gte");

        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 22, 30, 0).unwrap();
        let params = extractor.params_for(Some(&Bookmark::Timestamp(ts)));
        assert_eq!(params["release_date.gte"], "2024-05-17");
        assert_eq!(params["sort_by"], "primary_release_date");

        let params = extractor.params_for(Some(&Bookmark::Sequence(90)));
        assert_eq!(params["release_date.gte"], "90");

        assert!(!extractor.params_for(None).contains_key("release_date.gte"));
    }

    #[test]
    fn test_job_config_parses() {
        let config: ApiJobConfig = serde_json::from_value(serde_json::json!({
            "table_name": "etl.movies",
            "bookmark": "2024-01-01T00:00:00Z",
            "primary_keys": ["id"],
            "range_column": "release_date",
            "endpoint": "discover/movie",
            "params": {"sort_by": "primary_release_date"},
            "bookmark_param": "release_date.gte",
            "max_pages": 2
        }))
        .unwrap();

        assert!(config.is_active());
        assert_eq!(config.max_pages(), Some(2));
        assert_eq!(config.params["sort_by"], "primary_release_date");
    }

    #[test]
    fn test_url_joins_cleanly() {
        let client = PagedApiClient::new("https://api.example.com/3/", "t").unwrap();
        assert_eq!(client.url("/discover/movie"), "https://api.example.com/3/discover/movie");
    }
}
