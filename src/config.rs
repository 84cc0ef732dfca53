//! Run configuration assembled from the environment (and `.env` / secrets
//! file), with optional overrides from the command line.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

use crate::batch::TrailingBatch;
use crate::encoder::HttpEncoder;
use crate::ledger::MAX_ROWS_PER_INSERT;
use crate::shard::Shard;
use crate::upload::{FallbackPolicy, ValidationRules};
use crate::util::env::{env_flag, env_opt, env_parse, env_parse_opt, env_req};
use crate::vector_store::{PineconeStore, QdrantStore, VectorStore};

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_EMBED_DIM: usize = 512;
pub const DEFAULT_ENCODER_MODEL: &str = "Marqo/marqo-fashionCLIP";
/// The candidate stream keeps one connection checked out for the whole run;
/// the ledger and the deletion sweep need another.
pub const MIN_DB_CONNECTIONS: u32 = 2;

/// Values given on the command line; `None` means "use the environment".
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub batch_size: Option<usize>,
    pub shard_index: Option<u32>,
    pub total_shards: Option<u32>,
    pub limit: Option<u64>,
    pub shuffle: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub batch_size: usize,
    pub shard: Option<Shard>,
    pub limit: Option<u64>,
    pub shuffle: bool,
    pub fetch_timeout: Duration,
    pub trailing: TrailingBatch,
    pub fallback: FallbackPolicy,
    pub rules: ValidationRules,
    pub db_max_connections: u32,
    pub ledger_auto_create: bool,
}

impl RunConfig {
    pub fn from_env(overrides: &RunOverrides) -> Result<Self> {
        let batch_size = check_batch_size(match overrides.batch_size {
            Some(n) => n,
            None => env_parse_opt::<usize>("BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE),
        })?;

        let shard_index = match overrides.shard_index {
            Some(i) => Some(i),
            None => env_parse_opt::<u32>("SHARD_INDEX")?,
        };
        let total_shards = match overrides.total_shards {
            Some(t) => Some(t),
            None => env_parse_opt::<u32>("TOTAL_SHARDS")?,
        };
        let shard = Shard::from_parts(shard_index, total_shards)?;

        let limit = match overrides.limit {
            Some(n) => Some(n),
            None => env_parse_opt::<u64>("ITEM_LIMIT")?,
        };

        let shuffle = match overrides.shuffle {
            Some(s) => s,
            None => resolve_shuffle(
                env_flag("SHUFFLE", true),
                env_parse_opt::<f64>("SHUFFLE_PROBABILITY")?,
                &mut rand::thread_rng(),
            )?,
        };

        let trailing = match env_opt("TRAILING_BATCH") {
            Some(raw) => raw.parse()?,
            None => TrailingBatch::default(),
        };
        let fallback = match env_opt("FALLBACK_STRATEGY") {
            Some(raw) => raw.parse()?,
            None => FallbackPolicy::default(),
        };

        Ok(Self {
            batch_size,
            shard,
            limit,
            shuffle,
            fetch_timeout: Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", 10u64).max(1)),
            trailing,
            fallback,
            rules: ValidationRules {
                require_category: env_flag("REQUIRE_CATEGORY", false),
            },
            db_max_connections: check_pool_size(env_parse("DB_MAX_CONNECTIONS", 4u32))?,
            ledger_auto_create: env_flag("LEDGER_AUTO_CREATE", false),
        })
    }
}

/// One flushed batch becomes one ledger insert, so it must fit its bind limit.
pub fn check_batch_size(batch_size: usize) -> Result<usize> {
    anyhow::ensure!(batch_size >= 1, "batch size must be at least 1");
    anyhow::ensure!(
        batch_size <= MAX_ROWS_PER_INSERT,
        "batch size {batch_size} exceeds the ledger insert limit of {MAX_ROWS_PER_INSERT}"
    );
    Ok(batch_size)
}

pub fn check_pool_size(max_connections: u32) -> Result<u32> {
    anyhow::ensure!(
        max_connections >= MIN_DB_CONNECTIONS,
        "DB_MAX_CONNECTIONS must be at least {MIN_DB_CONNECTIONS}, got {max_connections}"
    );
    Ok(max_connections)
}

/// A probability, when given, decides per run; otherwise the flag does.
pub fn resolve_shuffle<R: Rng>(flag: bool, probability: Option<f64>, rng: &mut R) -> Result<bool> {
    match probability {
        Some(p) => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&p),
                "SHUFFLE_PROBABILITY must be within [0, 1], got {p}"
            );
            Ok(rng.gen_bool(p))
        }
        None => Ok(flag),
    }
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimension: usize,
    pub timeout: Duration,
}

impl EncoderConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env_req("ENCODER_URL")?,
            model: env_opt("ENCODER_MODEL").unwrap_or_else(|| DEFAULT_ENCODER_MODEL.into()),
            api_key: env_opt("ENCODER_API_KEY"),
            dimension: env_parse("EMBED_DIM", DEFAULT_EMBED_DIM),
            timeout: Duration::from_secs(env_parse("ENCODER_TIMEOUT_SECS", 60u64).max(1)),
        })
    }

    pub fn build(&self) -> Result<HttpEncoder> {
        HttpEncoder::new(
            self.url.clone(),
            self.model.clone(),
            self.api_key.clone(),
            self.dimension,
            self.timeout,
        )
    }
}

#[derive(Debug, Clone)]
pub enum VectorStoreConfig {
    Qdrant {
        url: String,
        api_key: Option<String>,
        collection: String,
        timeout: Duration,
    },
    Pinecone {
        host: String,
        api_key: String,
        namespace: Option<String>,
        timeout: Duration,
    },
}

impl VectorStoreConfig {
    pub fn from_env() -> Result<Self> {
        let backend = env_opt("VECTOR_STORE").unwrap_or_else(|| "qdrant".into());
        match backend.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Self::qdrant_from_env(),
            "pinecone" => Ok(Self::Pinecone {
                host: env_req("PINECONE_HOST")?,
                api_key: env_req("PINECONE_API_KEY")?,
                namespace: env_opt("PINECONE_NAMESPACE"),
                timeout: sink_timeout(),
            }),
            other => anyhow::bail!("unknown VECTOR_STORE {other:?} (qdrant|pinecone)"),
        }
    }

    pub fn qdrant_from_env() -> Result<Self> {
        Ok(Self::Qdrant {
            url: env_req("QDRANT_URL")?,
            api_key: env_opt("QDRANT_API_KEY"),
            collection: env_opt("QDRANT_COLLECTION").unwrap_or_else(|| "items".into()),
            timeout: sink_timeout(),
        })
    }

    pub fn build(&self) -> Result<Box<dyn VectorStore>> {
        match self {
            Self::Qdrant { .. } => Ok(Box::new(self.build_qdrant()?)),
            Self::Pinecone {
                host,
                api_key,
                namespace,
                timeout,
            } => Ok(Box::new(PineconeStore::new(
                host,
                api_key,
                namespace.clone(),
                *timeout,
            )?)),
        }
    }

    pub fn build_qdrant(&self) -> Result<QdrantStore> {
        match self {
            Self::Qdrant {
                url,
                api_key,
                collection,
                timeout,
            } => QdrantStore::new(url, api_key.as_deref(), collection, *timeout)
                .context("failed to build Qdrant client"),
            Self::Pinecone { .. } => anyhow::bail!("this operation requires the qdrant backend"),
        }
    }
}

fn sink_timeout() -> Duration {
    Duration::from_secs(env_parse("SINK_TIMEOUT_SECS", 30u64).max(1))
}
