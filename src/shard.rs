//! Deterministic partitioning of the catalog id space across worker processes.
//!
//! Every process is started with a distinct `shard_index` in `[0, total_shards)`.
//! The hash is SHA-256 over the UTF-8 id (first 8 bytes, big endian), which is
//! stable across processes, platforms and releases, unlike `DefaultHasher`.

use sha2::{Digest, Sha256};
use std::fmt;

/// Returns true when `id` belongs to shard `shard_index` of `total_shards`.
///
/// `total_shards == 0` selects nothing.
pub fn assign(id: &str, shard_index: u32, total_shards: u32) -> bool {
    if total_shards == 0 {
        return false;
    }
    stable_hash(id) % u64::from(total_shards) == u64::from(shard_index)
}

fn stable_hash(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// A validated `(index, total)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    index: u32,
    total: u32,
}

impl Shard {
    pub fn new(index: u32, total: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(total >= 1, "total_shards must be at least 1");
        anyhow::ensure!(
            index < total,
            "shard_index {index} out of range for total_shards {total}"
        );
        Ok(Self { index, total })
    }

    /// Builds a shard from the optional pair found in config. Both or neither
    /// must be given.
    pub fn from_parts(index: Option<u32>, total: Option<u32>) -> anyhow::Result<Option<Self>> {
        match (index, total) {
            (None, None) => Ok(None),
            (Some(i), Some(t)) => Self::new(i, t).map(Some),
            (Some(_), None) => anyhow::bail!("SHARD_INDEX given without TOTAL_SHARDS"),
            (None, Some(_)) => anyhow::bail!("TOTAL_SHARDS given without SHARD_INDEX"),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn contains(&self, id: &str) -> bool {
        assign(id, self.index, self.total)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}
