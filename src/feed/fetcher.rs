use futures::StreamExt;
use reqwest::redirect::Policy;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::feed::parser::{parse_feed, RawFeed};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const MAX_REDIRECTS: usize = 3;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Errors raised while retrieving and parsing a remote feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Body could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server kept answering 429 Too Many Requests
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),
}

/// Where feeds come from.
///
/// The service only needs "give me the parsed feed at this URL"; the default
/// implementation is [`HttpFeedSource`], tests inject their own.
pub trait FeedSource: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<RawFeed, FetchError>> + Send;
}

/// Fetches feeds over HTTP, directly or through a relay endpoint.
///
/// Relay mode issues `GET <endpoint>?feedUrl=<url>` instead of `GET <url>`.
/// 429 and 5xx responses are retried with exponential backoff; bodies are
/// streamed with a size cap.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    proxy_endpoint: Option<Url>,
    request_timeout: Duration,
    max_feed_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpFeedSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            proxy_endpoint: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_feed_size: DEFAULT_MAX_FEED_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Build a source (and its HTTP client) from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let mut source = Self::new(client)
            .with_request_timeout(Duration::from_secs(config.request_timeout_secs))
            .with_max_feed_size(config.max_feed_size_bytes)
            .with_max_retries(config.max_retries);
        if let Some(endpoint) = &config.proxy_endpoint {
            source = source.with_proxy_endpoint(endpoint)?;
        }
        Ok(source)
    }

    pub fn with_proxy_endpoint(mut self, endpoint: &str) -> Result<Self, FetchError> {
        let endpoint =
            Url::parse(endpoint).map_err(|_| FetchError::InvalidUrl(endpoint.to_owned()))?;
        self.proxy_endpoint = Some(endpoint);
        Ok(self)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_feed_size(mut self, bytes: usize) -> Self {
        self.max_feed_size = bytes;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Base delay before the first retry; doubles on every further attempt.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// The address actually requested for `feed_url`.
    fn request_url(&self, feed_url: &str) -> Result<Url, FetchError> {
        let target =
            Url::parse(feed_url).map_err(|_| FetchError::InvalidUrl(feed_url.to_owned()))?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(feed_url.to_owned()));
        }

        match &self.proxy_endpoint {
            Some(endpoint) => {
                let mut relayed = endpoint.clone();
                relayed.query_pairs_mut().append_pair("feedUrl", target.as_str());
                Ok(relayed)
            }
            None => Ok(target),
        }
    }

    async fn fetch_bytes(&self, feed_url: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.request_url(feed_url)?;
        let mut retry_count = 0;

        loop {
            let response = tokio::time::timeout(
                self.request_timeout,
                self.client.get(url.clone()).send(),
            )
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e)
                }
            })?;

            let status = response.status();
            let retryable =
                status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

            if retryable {
                if retry_count >= self.max_retries {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(self.max_retries)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = retry_delay(self.retry_backoff, retry_count);
                tracing::warn!(
                    feed = %feed_url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable response, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx and other non-success statuses fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            return read_limited_bytes(response, self.max_feed_size).await;
        }
    }
}

/// Exponential backoff (`base`, `2 * base`, `4 * base`, ...) capped at a minute.
fn retry_delay(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry_count)).min(MAX_RETRY_DELAY)
}

impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<RawFeed, FetchError> {
        let bytes = self.fetch_bytes(url).await?;
        let feed = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        tracing::debug!(
            feed = %url,
            bytes = bytes.len(),
            items = feed.items.len(),
            "Fetched feed"
        );
        Ok(feed)
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }
        if attempt
            .previous()
            .iter()
            .any(|prev| prev.as_str() == attempt.url().as_str())
        {
            return attempt.error("Redirect loop detected");
        }
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
