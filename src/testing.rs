//! In-memory doubles for the pipeline's external collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::batch::PendingItem;
use crate::catalog::{scope_candidates, CandidateQuery, CandidateSource};
use crate::encoder::Encoder;
use crate::fetch::{FetchError, ImageFetcher};
use crate::ledger::Ledger;
use crate::model::{CandidateItem, LedgerRow, Point};
use crate::sink::{SinkError, SinkName};
use crate::sweep::ItemDeleter;
use crate::vector_store::VectorStore;

pub fn pending(item: CandidateItem) -> PendingItem {
    PendingItem {
        item,
        image: Bytes::from_static(b"jpeg"),
        point_id: Uuid::new_v4(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    fail_bulk: bool,
    rejected_points: HashSet<Uuid>,
    rejected_items: HashSet<i64>,
    points: Mutex<Vec<Point>>,
    calls: Mutex<Vec<usize>>,
}

impl MemoryStore {
    /// Every multi-point upsert fails; single points go through.
    pub fn failing_bulk() -> Self {
        Self {
            fail_bulk: true,
            ..Self::default()
        }
    }

    pub fn rejecting(mut self, ids: Vec<Uuid>) -> Self {
        self.rejected_points.extend(ids);
        self
    }

    pub fn rejecting_items(mut self, item_ids: &[i64]) -> Self {
        self.rejected_items.extend(item_ids.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn point_ids(&self) -> Vec<Uuid> {
        self.points.lock().unwrap().iter().map(|p| p.id).collect()
    }

    pub fn vinted_ids(&self) -> Vec<String> {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.payload.get("vinted_id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    fn is_rejected(&self, point: &Point) -> bool {
        let item_id = point.payload.get("id").and_then(|v| v.as_i64()).unwrap_or_default();
        self.rejected_points.contains(&point.id) || self.rejected_items.contains(&item_id)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, points: &[Point]) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push(points.len());
        if self.fail_bulk && points.len() > 1 {
            return Err(SinkError::transient(SinkName::VectorStore, "bulk upsert timed out"));
        }
        if points.iter().any(|p| self.is_rejected(p)) {
            return Err(SinkError::rejected(SinkName::VectorStore, "bad point"));
        }
        self.points.lock().unwrap().extend(points.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    fail: bool,
    rows: Mutex<Vec<LedgerRow>>,
    calls: Mutex<Vec<usize>>,
}

impl MemoryLedger {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn point_ids(&self) -> Vec<Uuid> {
        self.rows.lock().unwrap().iter().map(|r| r.point_id).collect()
    }

    pub fn item_ids(&self) -> HashSet<i64> {
        self.rows.lock().unwrap().iter().map(|r| r.item_id).collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert(&self, rows: &[LedgerRow]) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push(rows.len());
        if self.fail {
            return Err(SinkError::transient(SinkName::Ledger, "connection refused"));
        }
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }
}

/// Catalog with the same selection contract as the SQL query: latest row per
/// `vinted_id`, minus ledgered and deleted items, then shard and limit.
pub struct MemoryCatalog {
    items: Vec<CandidateItem>,
    ledger: Arc<MemoryLedger>,
    query: CandidateQuery,
    fail_after: Option<usize>,
    deleted: Mutex<HashSet<String>>,
    delete_calls: Mutex<Vec<Vec<String>>>,
}

impl MemoryCatalog {
    pub fn new(items: Vec<CandidateItem>, ledger: Arc<MemoryLedger>) -> Self {
        Self {
            items,
            ledger,
            query: CandidateQuery::default(),
            fail_after: None,
            deleted: Mutex::new(HashSet::new()),
            delete_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_query(mut self, query: CandidateQuery) -> Self {
        self.query = query;
        self
    }

    pub fn failing_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.delete_calls.lock().unwrap().clone()
    }

    fn selectable(&self) -> Vec<CandidateItem> {
        let ledgered = self.ledger.item_ids();
        let deleted = self.deleted.lock().unwrap().clone();
        let mut latest: HashMap<&str, &CandidateItem> = HashMap::new();
        for item in self.items.iter().filter(|i| !ledgered.contains(&i.id)) {
            latest
                .entry(item.vinted_id.as_str())
                .and_modify(|cur| {
                    if (item.created_at, item.id) > (cur.created_at, cur.id) {
                        *cur = item;
                    }
                })
                .or_insert(item);
        }
        let mut out: Vec<CandidateItem> = latest
            .into_values()
            .filter(|i| !deleted.contains(&i.vinted_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        out
    }
}

impl CandidateSource for MemoryCatalog {
    fn candidates(&self) -> BoxStream<'_, Result<CandidateItem>> {
        let mut rows: Vec<Result<CandidateItem>> = self.selectable().into_iter().map(Ok).collect();
        if let Some(n) = self.fail_after {
            rows.truncate(n);
            rows.push(Err(anyhow::anyhow!("connection reset by peer")));
        }
        scope_candidates(stream::iter(rows).boxed(), self.query.shard, self.query.limit)
    }
}

#[async_trait]
impl ItemDeleter for MemoryCatalog {
    async fn delete_items(&self, vinted_ids: &[String]) -> Result<u64> {
        self.delete_calls.lock().unwrap().push(vinted_ids.to_vec());
        let mut deleted = self.deleted.lock().unwrap();
        let before = deleted.len();
        deleted.extend(vinted_ids.iter().cloned());
        Ok((deleted.len() - before) as u64)
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    gone: Mutex<HashSet<String>>,
    flaky: Mutex<HashSet<String>>,
}

impl FakeFetcher {
    pub fn gone(&self, url: &str) {
        self.gone.lock().unwrap().insert(url.to_string());
    }

    pub fn flaky(&self, url: &str) {
        self.flaky.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        if self.gone.lock().unwrap().contains(url) {
            return Err(FetchError::Permanent("status 404 Not Found".into()));
        }
        if self.flaky.lock().unwrap().contains(url) {
            return Err(FetchError::Transient("operation timed out".into()));
        }
        Ok(Bytes::from(url.as_bytes().to_vec()))
    }
}

pub struct FakeEncoder {
    dimension: usize,
    output_dimension: usize,
    failing_calls: Mutex<HashSet<usize>>,
    calls: Mutex<Vec<usize>>,
}

impl FakeEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            output_dimension: dimension,
            failing_calls: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning_dimension(mut self, dim: usize) -> Self {
        self.output_dimension = dim;
        self
    }

    /// Makes the `n`-th call (0-based) fail.
    pub fn fail_call(&self, n: usize) {
        self.failing_calls.lock().unwrap().insert(n);
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, images: &[Bytes]) -> Result<Vec<Vec<f32>>> {
        let call_no = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(images.len());
            calls.len() - 1
        };
        if self.failing_calls.lock().unwrap().contains(&call_no) {
            anyhow::bail!("CUDA out of memory");
        }
        Ok(images
            .iter()
            .map(|img| vec![img.len() as f32; self.output_dimension])
            .collect())
    }
}
