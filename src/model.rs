//! Records flowing through the pipeline: catalog rows in, points and ledger rows out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One catalog listing eligible for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CandidateItem {
    /// Internal relational id; this is what the ledger stores.
    pub id: i64,
    /// External catalog id; dedup, sharding and deletion key on it.
    pub vinted_id: String,
    /// Listing page URL.
    pub url: Option<String>,
    pub image_location: Option<String>,
    pub catalog_id: Option<i64>,
    pub category_type: Option<String>,
    pub women: Option<bool>,
    pub price: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl CandidateItem {
    /// Vector-store payload: the item's fields plus the availability flag.
    pub fn to_payload(&self) -> Map<String, Value> {
        let mut payload = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        payload.insert("is_available".into(), Value::Bool(true));
        payload
    }
}

/// A vector-store record for one candidate item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

/// Ledger entry linking a catalog item to the point that embeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerRow {
    pub item_id: i64,
    pub point_id: Uuid,
}

#[cfg(test)]
pub(crate) fn sample_item(id: i64) -> CandidateItem {
    CandidateItem {
        id,
        vinted_id: format!("v{id}"),
        url: Some(format!("https://www.vinted.example/items/{id}")),
        image_location: Some(format!("https://images.example.com/{id}.jpg")),
        catalog_id: Some(12),
        category_type: Some("dress".into()),
        women: Some(true),
        price: Some(14.5),
        created_at: None,
    }
}
