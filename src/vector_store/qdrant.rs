//! Qdrant REST client: point upserts, payload indexes and availability flags.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::VectorStore;
use crate::model::Point;
use crate::sink::{SinkError, SinkName};

/// Payload fields that can be indexed, with their Qdrant schema type.
pub const INDEXABLE_FIELDS: &[(&str, &str)] = &[
    ("women", "bool"),
    ("category_type", "keyword"),
    ("url", "keyword"),
    ("price", "float"),
];

pub fn payload_schema_for(field: &str) -> Result<&'static str> {
    INDEXABLE_FIELDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, schema)| *schema)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "field {field:?} is not indexable; expected one of {:?}",
                INDEXABLE_FIELDS.iter().map(|(n, _)| *n).collect::<Vec<_>>()
            )
        })
}

#[derive(Clone)]
pub struct QdrantStore {
    http: Client,
    base_url: String,
    collection: String,
}

#[derive(Serialize)]
struct WirePoint<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a Map<String, Value>,
}

impl QdrantStore {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Qdrant URL must be an http(s) URL"
        );
        anyhow::ensure!(!collection.trim().is_empty(), "missing Qdrant collection name");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(key.trim()).context("invalid Qdrant API key")?,
            );
        }
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.trim().to_string(),
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(), SinkError> {
        let resp = req
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

    /// Creates a payload index for one of `INDEXABLE_FIELDS`.
    pub async fn create_payload_index(&self, field: &str) -> Result<()> {
        let schema = payload_schema_for(field)?;
        let body = json!({ "field_name": field, "field_schema": schema });
        self.send(
            self.http
                .put(self.collection_url("/index?wait=true"))
                .json(&body),
        )
        .await?;
        info!(collection = %self.collection, field, schema, "payload index created");
        Ok(())
    }

    /// Sets `is_available` on every point whose payload `vinted_id` is in `vinted_ids`.
    pub async fn set_availability(&self, vinted_ids: &[String], available: bool) -> Result<()> {
        if vinted_ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "payload": { "is_available": available },
            "filter": { "must": [ { "key": "vinted_id", "match": { "any": vinted_ids } } ] }
        });
        self.send(
            self.http
                .post(self.collection_url("/points/payload?wait=true"))
                .json(&body),
        )
        .await?;
        debug!(count = vinted_ids.len(), available, "availability updated");
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn upsert(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        let wire: Vec<WirePoint<'_>> = points
            .iter()
            .map(|p| WirePoint {
                id: p.id.to_string(),
                vector: &p.vector,
                payload: &p.payload,
            })
            .collect();
        self.send(
            self.http
                .put(self.collection_url("/points?wait=true"))
                .json(&json!({ "points": wire })),
        )
        .await
    }
}
