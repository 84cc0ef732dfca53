//! Pinecone data-plane REST client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};

use super::VectorStore;
use crate::model::Point;
use crate::sink::{SinkError, SinkName};

#[derive(Clone)]
pub struct PineconeStore {
    http: Client,
    host: String,
    namespace: Option<String>,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: Vec<WireVector<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
struct WireVector<'a> {
    id: String,
    values: &'a [f32],
    metadata: Map<String, Value>,
}

/// Pinecone metadata accepts strings, numbers, bools and string lists, never null.
pub fn pinecone_metadata(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(_, v)| !v.is_null())
        .filter(|(_, v)| !v.is_object())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl PineconeStore {
    pub fn new(
        host: &str,
        api_key: &str,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Pinecone API key");
        let host = host.trim().trim_end_matches('/');
        anyhow::ensure!(!host.is_empty(), "missing Pinecone index host");
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(api_key.trim()).context("invalid Pinecone API key")?,
        );
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Pinecone HTTP client")?;
        Ok(Self {
            http,
            host,
            namespace: namespace.filter(|n| !n.trim().is_empty()),
        })
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn name(&self) -> &'static str {
        "pinecone"
    }

    async fn upsert(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        let request = UpsertRequest {
            vectors: points
                .iter()
                .map(|p| WireVector {
                    id: p.id.to_string(),
                    values: &p.vector,
                    metadata: pinecone_metadata(&p.payload),
                })
                .collect(),
            namespace: self.namespace.as_deref(),
        };
        let resp = self
            .http
            .post(format!("{}/vectors/upsert", self.host))
            .json(&request)
            .send()
            .await
            .map_err(|e| SinkError::from_reqwest(SinkName::VectorStore, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::from_status(SinkName::VectorStore, status, &body))
    }
}
