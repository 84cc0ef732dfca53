//! Image download with transient/permanent failure classification.
//!
//! Permanent failures end with the item deleted from the catalog. Only a
//! non-retryable 4xx from the image host or a URL that cannot be requested at
//! all is permanent.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Worth trying again on a later run; the item is only skipped.
    #[error("transient image fetch failure: {0}")]
    Transient(String),
    /// The image is gone; the item is queued for the deletion sweep.
    #[error("permanent image fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent(_))
    }
}

/// Maps an HTTP status to the failure class, `None` for success.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let msg = format!("status {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Some(FetchError::Transient(msg))
    } else {
        Some(FetchError::Permanent(msg))
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Permanent(format!("invalid request: {err}"))
    } else {
        FetchError::Transient(err.to_string())
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// `reqwest` based fetcher with a per-request timeout.
#[derive(Clone)]
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build image HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = url::Url::parse(url.trim())
            .map_err(|e| FetchError::Permanent(format!("unparseable url {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::Permanent(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let resp = self
            .http
            .get(parsed)
            .header(header::ACCEPT, "image/*")
            .send()
            .await
            .map_err(classify_reqwest)?;
        if let Some(err) = classify_status(resp.status()) {
            debug!(url, status = %resp.status(), "image fetch rejected");
            return Err(err);
        }
        let body = resp.bytes().await.map_err(classify_reqwest)?;
        if body.is_empty() {
            return Err(FetchError::Transient("empty body".into()));
        }
        Ok(body)
    }
}
