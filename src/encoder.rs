//! Batch image encoder boundary.
//!
//! The model itself runs out of process (an inference service hosting
//! `Marqo/marqo-fashionCLIP` or similar); this module only speaks its JSON
//! protocol and checks the shape of what comes back.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Dimensionality of every vector returned by `encode`.
    fn dimension(&self) -> usize;

    /// Encodes images in order; the output has the same length and order.
    async fn encode(&self, images: &[Bytes]) -> Result<Vec<Vec<f32>>>;
}

/// Inference endpoint client.
#[derive(Clone)]
pub struct HttpEncoder {
    http: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEncoder {
    pub fn new(
        endpoint: String,
        model: String,
        api_key: Option<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(
            endpoint.starts_with("http://") || endpoint.starts_with("https://"),
            "encoder endpoint must be an http(s) URL"
        );
        anyhow::ensure!(dimension > 0, "embedding dimension must be positive");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                    .context("invalid encoder API key")?,
            );
        }
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build encoder HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            dimension,
        })
    }
}

#[async_trait]
impl Encoder for HttpEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, images: &[Bytes]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded: Vec<String> = images.iter().map(|img| engine.encode(img)).collect();
        let request = EncodeRequest {
            model: &self.model,
            images: &encoded,
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("encoder request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "encoder returned {status}: {}",
                body.chars().take(500).collect::<String>()
            );
        }
        let payload: EncodeResponse = resp
            .json()
            .await
            .context("failed to parse encoder response")?;
        let vectors = payload.into_embeddings(images.len())?;
        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

/// Every vector must have exactly `dimension` finite components.
pub fn check_dimensions(vectors: &[Vec<f32>], dimension: usize) -> Result<()> {
    for (i, v) in vectors.iter().enumerate() {
        anyhow::ensure!(
            v.len() == dimension,
            "embedding {i} has {} dims, expected {dimension}",
            v.len()
        );
        anyhow::ensure!(
            v.iter().all(|x| x.is_finite()),
            "embedding {i} contains non-finite values"
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    model: &'a str,
    images: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    #[serde(default)]
    data: Vec<EncodeData>,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct EncodeData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EncodeResponse {
    fn into_embeddings(self, expected_len: usize) -> Result<Vec<Vec<f32>>> {
        if !self.data.is_empty() {
            anyhow::ensure!(
                self.data.len() == expected_len,
                "encoder returned {} embeddings for {} images",
                self.data.len(),
                expected_len
            );
            let mut data = self.data;
            data.sort_by_key(|d| d.index.unwrap_or(0));
            return Ok(data.into_iter().map(|d| d.embedding).collect());
        }
        if !self.embeddings.is_empty() {
            anyhow::ensure!(
                self.embeddings.len() == expected_len,
                "encoder returned {} embeddings for {} images",
                self.embeddings.len(),
                expected_len
            );
            return Ok(self.embeddings);
        }
        Err(anyhow!("encoder response missing embeddings"))
    }
}
