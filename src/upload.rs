//! Two-phase write of one flushed batch: vector store first, ledger second.
//!
//! A ledger row is only ever written for a point the vector store accepted.
//! When the bulk upsert fails, a [`FallbackStrategy`] re-attempts the points
//! in smaller units and the ledger receives rows for the survivors only.
//! Points whose ledger insert fails stay in the vector store as orphans; they
//! are not cleaned up.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::batch::PendingItem;
use crate::ledger::Ledger;
use crate::model::{LedgerRow, Point};
use crate::sink::SinkOutcome;
use crate::vector_store::VectorStore;

/// Why a record was dropped before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalid {
    MissingVintedId,
    MissingItemId,
    MissingImageUrl,
    MissingCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationRules {
    /// Reject records without a category instead of defaulting it to "".
    pub require_category: bool,
}

fn blank(v: Option<&str>) -> bool {
    v.map(|s| s.trim().is_empty()).unwrap_or(true)
}

/// Builds the point and ledger row for one record, or says why it is invalid.
pub fn prepare_record(
    pending: &PendingItem,
    vector: Vec<f32>,
    rules: ValidationRules,
) -> Result<(Point, LedgerRow), Invalid> {
    let item = &pending.item;
    if item.vinted_id.trim().is_empty() {
        return Err(Invalid::MissingVintedId);
    }
    if item.id <= 0 {
        return Err(Invalid::MissingItemId);
    }
    if blank(item.image_location.as_deref()) {
        return Err(Invalid::MissingImageUrl);
    }
    let category_missing = blank(item.category_type.as_deref());
    if category_missing && rules.require_category {
        return Err(Invalid::MissingCategory);
    }

    let mut payload = item.to_payload();
    if category_missing {
        payload.insert("category_type".into(), Value::String(String::new()));
    }
    let point = Point {
        id: pending.point_id,
        vector,
        payload,
    };
    let row = LedgerRow {
        item_id: item.id,
        point_id: pending.point_id,
    };
    Ok((point, row))
}

/// How points are re-attempted after a failed bulk upsert.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the indices (into `points`) that were upserted.
    async fn recover(&self, store: &dyn VectorStore, points: &[Point]) -> Vec<usize>;
}

/// One upsert call per point.
pub struct Singleton;

#[async_trait]
impl FallbackStrategy for Singleton {
    fn name(&self) -> &'static str {
        "singleton"
    }

    async fn recover(&self, store: &dyn VectorStore, points: &[Point]) -> Vec<usize> {
        let mut ok = Vec::with_capacity(points.len());
        for (i, point) in points.iter().enumerate() {
            match store.upsert(std::slice::from_ref(point)).await {
                Ok(()) => ok.push(i),
                Err(e) => debug!(point_id = %point.id, error = %e, "single point upsert failed"),
            }
        }
        ok
    }
}

/// One upsert call per chunk of at most `size` points.
pub struct SubBatch {
    pub size: usize,
}

#[async_trait]
impl FallbackStrategy for SubBatch {
    fn name(&self) -> &'static str {
        "sub-batch"
    }

    async fn recover(&self, store: &dyn VectorStore, points: &[Point]) -> Vec<usize> {
        let size = self.size.max(1);
        let mut ok = Vec::with_capacity(points.len());
        for (chunk_no, chunk) in points.chunks(size).enumerate() {
            match store.upsert(chunk).await {
                Ok(()) => ok.extend(chunk_no * size..chunk_no * size + chunk.len()),
                Err(e) => debug!(chunk = chunk_no, len = chunk.len(), error = %e, "chunk upsert failed"),
            }
        }
        ok
    }
}

/// No second attempt: a failed bulk upsert loses the batch.
pub struct Disabled;

#[async_trait]
impl FallbackStrategy for Disabled {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn recover(&self, _store: &dyn VectorStore, _points: &[Point]) -> Vec<usize> {
        Vec::new()
    }
}

/// Configurable choice of fallback strategy (`singleton`, `sub-batch:<n>`, `none`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    #[default]
    Singleton,
    SubBatch(usize),
    Disabled,
}

impl FallbackPolicy {
    pub fn strategy(self) -> Box<dyn FallbackStrategy> {
        match self {
            FallbackPolicy::Singleton => Box::new(Singleton),
            FallbackPolicy::SubBatch(size) => Box::new(SubBatch { size }),
            FallbackPolicy::Disabled => Box::new(Disabled),
        }
    }
}

impl FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        match raw.as_str() {
            "singleton" | "single" => return Ok(FallbackPolicy::Singleton),
            "none" | "off" | "disabled" => return Ok(FallbackPolicy::Disabled),
            _ => {}
        }
        if let Some(n) = raw.strip_prefix("sub-batch:") {
            let size: usize = n
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid sub-batch size {n:?}: {e}"))?;
            anyhow::ensure!(size >= 1, "sub-batch size must be at least 1");
            return Ok(FallbackPolicy::SubBatch(size));
        }
        anyhow::bail!("unknown fallback strategy {s:?} (singleton|sub-batch:<n>|none)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPath {
    /// Nothing valid to write; no sink was called.
    Skipped,
    Bulk,
    Fallback,
}

/// Per-batch accounting. Always `ledgered <= upserted <= valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub valid: usize,
    pub invalid: usize,
    pub upserted: usize,
    pub ledgered: usize,
    pub path: UploadPath,
}

pub struct DualSinkUploader<'a> {
    store: &'a dyn VectorStore,
    ledger: &'a dyn Ledger,
    fallback: Box<dyn FallbackStrategy>,
    rules: ValidationRules,
}

impl<'a> DualSinkUploader<'a> {
    pub fn new(
        store: &'a dyn VectorStore,
        ledger: &'a dyn Ledger,
        fallback: Box<dyn FallbackStrategy>,
        rules: ValidationRules,
    ) -> Self {
        Self {
            store,
            ledger,
            fallback,
            rules,
        }
    }

    async fn upsert_points(&self, points: &[Point]) -> SinkOutcome {
        let outcome = SinkOutcome::from_result(self.store.upsert(points).await);
        if let Some(e) = &outcome.error {
            warn!(
                store = self.store.name(),
                points = points.len(),
                transient = e.is_transient(),
                error = %e,
                "bulk vector upsert failed"
            );
        }
        outcome
    }

    async fn insert_rows(&self, rows: &[LedgerRow]) -> SinkOutcome {
        let outcome = SinkOutcome::from_result(self.ledger.insert(rows).await);
        if let Some(e) = &outcome.error {
            warn!(
                rows = rows.len(),
                transient = e.is_transient(),
                error = %e,
                "ledger insert failed; upserted points are left without ledger rows"
            );
        }
        outcome
    }

    /// Writes one batch. `embeddings` is parallel to `batch`.
    pub async fn upload(&self, batch: &[PendingItem], embeddings: Vec<Vec<f32>>) -> UploadReport {
        let mut points = Vec::with_capacity(batch.len());
        let mut rows = Vec::with_capacity(batch.len());
        let mut invalid = 0usize;
        for (pending, vector) in batch.iter().zip(embeddings) {
            match prepare_record(pending, vector, self.rules) {
                Ok((point, row)) => {
                    points.push(point);
                    rows.push(row);
                }
                Err(reason) => {
                    invalid += 1;
                    debug!(item_id = pending.item.id, vinted_id = %pending.item.vinted_id, ?reason, "dropping invalid record");
                }
            }
        }
        let valid = points.len();
        if valid == 0 {
            return UploadReport {
                valid,
                invalid,
                upserted: 0,
                ledgered: 0,
                path: UploadPath::Skipped,
            };
        }

        if self.upsert_points(&points).await.ok {
            let ledgered = if self.insert_rows(&rows).await.ok { valid } else { 0 };
            return UploadReport {
                valid,
                invalid,
                upserted: valid,
                ledgered,
                path: UploadPath::Bulk,
            };
        }

        let recovered = self.fallback.recover(self.store, &points).await;
        let survivors: Vec<LedgerRow> = recovered.iter().filter_map(|&i| rows.get(i).copied()).collect();
        let upserted = survivors.len();
        let ledgered = if upserted > 0 && self.insert_rows(&survivors).await.ok {
            upserted
        } else {
            0
        };
        debug!(
            strategy = self.fallback.name(),
            valid,
            upserted,
            ledgered,
            "fallback upload finished"
        );
        UploadReport {
            valid,
            invalid,
            upserted,
            ledgered,
            path: UploadPath::Fallback,
        }
    }
}
