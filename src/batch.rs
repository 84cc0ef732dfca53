use std::collections::HashSet;
use std::str::FromStr;

use bytes::Bytes;
use uuid::Uuid;

use crate::fetch::FetchError;
use crate::model::CandidateItem;

/// A fetched item waiting for the next flush.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub item: CandidateItem,
    pub image: Bytes,
    pub point_id: Uuid,
}

/// What `BatchAccumulator::accept` did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Buffered { full: bool },
    /// Permanent fetch failure, recorded for the deletion sweep.
    Undeliverable,
    /// Transient fetch failure, dropped for this run only.
    Skipped,
}

/// What to do with a partial batch left over when the stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingBatch {
    #[default]
    Flush,
    Drop,
}

impl FromStr for TrailingBatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flush" => Ok(TrailingBatch::Flush),
            "drop" => Ok(TrailingBatch::Drop),
            other => anyhow::bail!("unknown trailing batch policy {other:?} (flush|drop)"),
        }
    }
}

/// Catalog ids whose image is gone for good, in first-seen order.
#[derive(Debug, Default)]
pub struct UndeliverableSet {
    seen: HashSet<String>,
    ids: Vec<String>,
}

impl UndeliverableSet {
    pub fn insert(&mut self, vinted_id: &str) -> bool {
        if self.seen.insert(vinted_id.to_string()) {
            self.ids.push(vinted_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

/// Buffers fetched items until the configured batch size is reached.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    buffer: Vec<PendingItem>,
    undeliverable: UndeliverableSet,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            undeliverable: UndeliverableSet::default(),
        }
    }

    pub fn accept(&mut self, item: CandidateItem, fetched: Result<Bytes, FetchError>) -> Accepted {
        match fetched {
            Err(FetchError::Permanent(_)) => {
                self.undeliverable.insert(&item.vinted_id);
                Accepted::Undeliverable
            }
            Err(FetchError::Transient(_)) => Accepted::Skipped,
            Ok(image) => {
                self.buffer.push(PendingItem {
                    item,
                    image,
                    point_id: Uuid::new_v4(),
                });
                Accepted::Buffered {
                    full: self.buffer.len() >= self.batch_size,
                }
            }
        }
    }

    /// Hands over the buffered items; the buffer is empty afterwards.
    pub fn flush(&mut self) -> Vec<PendingItem> {
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size))
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn undeliverable(&self) -> &UndeliverableSet {
        &self.undeliverable
    }

    pub fn into_undeliverable(self) -> UndeliverableSet {
        self.undeliverable
    }
}
