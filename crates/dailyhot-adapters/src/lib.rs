//! Clients for the hot-list aggregation API and the summarization service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dailyhot_core::{AnalysisResponse, Category, HotList, RawItem};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dailyhot-adapters";

pub const DEFAULT_LIST_API_URL: &str = "https://dailyhot.yueyong.fun";
pub const DEFAULT_SUMMARIZER_URL: &str = "http://127.0.0.1:8001/summarize";

const UPSTREAM_OK: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries; the caller owns retry bookkeeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON-over-HTTP client with timeout and bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let body = self
            .send_with_retry(url, || {
                self.client
                    .get(url)
                    .header(reqwest::header::ACCEPT, "application/json")
            })
            .instrument(info_span!("http_get", url))
            .await?;
        decode(url, &body)
    }

    pub async fn post_json<B, T>(&self, url: &str, payload: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = self
            .send_with_retry(url, || self.client.post(url).json(payload))
            .instrument(info_span!("http_post", url))
            .await?;
        decode(url, &body)
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(url, %status, attempt, "retrying after http status");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(url, error = %err, attempt, "retrying after request error");
                    } else {
                        return Err(FetchError::Request(err));
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream answered code {code:?} for {url}")]
    UpstreamCode { code: Option<i64>, url: String },
}

/// Where hot lists come from. Failures surface as "no data this round".
#[async_trait]
pub trait HotListSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_categories(&self) -> Vec<Category>;

    async fn fetch_items(&self, path: &str) -> Option<HotList>;
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no url to analyze")]
    EmptyUrl,
    #[error("{0}")]
    Message(String),
}

/// Derives a summary and tags for the page behind a url.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, url: &str) -> Result<AnalysisResponse, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct RoutesEnvelope {
    code: Option<i64>,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    name: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    code: Option<i64>,
    title: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "updateTime")]
    update_time: Option<JsonValue>,
    #[serde(default)]
    data: Vec<JsonValue>,
}

/// Client for the DailyHot aggregation API.
#[derive(Debug, Clone)]
pub struct DailyHotClient {
    base_url: String,
    http: HttpFetcher,
}

impl DailyHotClient {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn list_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn try_categories(&self) -> Result<Vec<Category>, SourceError> {
        let url = format!("{}/all", self.base_url);
        let envelope: RoutesEnvelope = self.http.get_json(&url).await?;
        if envelope.code != Some(UPSTREAM_OK) {
            return Err(SourceError::UpstreamCode {
                code: envelope.code,
                url,
            });
        }
        Ok(envelope
            .routes
            .into_iter()
            .filter_map(|route| match (route.name, route.path) {
                (Some(name), Some(path)) if !name.is_empty() && !path.is_empty() => {
                    Some(Category { name, path })
                }
                _ => None,
            })
            .collect())
    }

    pub async fn try_items(&self, path: &str) -> Result<HotList, SourceError> {
        let url = self.list_url(path);
        let envelope: ListEnvelope = self.http.get_json(&url).await?;
        if envelope.code != Some(UPSTREAM_OK) {
            return Err(SourceError::UpstreamCode {
                code: envelope.code,
                url,
            });
        }

        let total = envelope.data.len();
        let items = envelope
            .data
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<RawItem>(entry) {
                Ok(item) => Some(item),
                Err(err) => {
                    warn!(path, error = %err, "dropping malformed hot-list entry");
                    None
                }
            })
            .collect::<Vec<_>>();
        if items.len() < total {
            debug!(path, kept = items.len(), total, "hot list had malformed entries");
        }

        Ok(HotList {
            title: envelope.title,
            kind: envelope.kind,
            update_time: envelope.update_time.map(|v| match v {
                JsonValue::String(s) => s,
                other => other.to_string(),
            }),
            items,
        })
    }
}

#[async_trait]
impl HotListSource for DailyHotClient {
    fn name(&self) -> &str {
        "dailyhot"
    }

    async fn fetch_categories(&self) -> Vec<Category> {
        match self.try_categories().await {
            Ok(categories) => categories,
            Err(err) => {
                error!(error = %err, "failed to fetch hot-list categories");
                Vec::new()
            }
        }
    }

    async fn fetch_items(&self, path: &str) -> Option<HotList> {
        match self.try_items(path).await {
            Ok(list) => Some(list),
            Err(err) => {
                error!(path, error = %err, "failed to fetch hot list");
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    url: &'a str,
}

/// Client for the url summarization service.
#[derive(Debug, Clone)]
pub struct SummarizerClient {
    endpoint: String,
    http: HttpFetcher,
}

impl SummarizerClient {
    pub fn new(endpoint: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            endpoint: endpoint.into(),
            http,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Enricher for SummarizerClient {
    fn name(&self) -> &str {
        "summarizer"
    }

    async fn analyze(&self, url: &str) -> Result<AnalysisResponse, EnrichError> {
        if url.trim().is_empty() {
            return Err(EnrichError::EmptyUrl);
        }
        let response = self
            .http
            .post_json(&self.endpoint, &SummarizeRequest { url })
            .await?;
        Ok(response)
    }
}
