use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use item_embedder::catalog::{
    sold_ledgered_ids, CandidateQuery, CatalogTables, PgCandidateSource, PgCatalogDeleter,
};
use item_embedder::config::{EncoderConfig, RunConfig, RunOverrides, VectorStoreConfig};
use item_embedder::fetch::HttpImageFetcher;
use item_embedder::ledger::PgLedger;
use item_embedder::telemetry::{init_tracing, DEFAULT_FILTER};
use item_embedder::upload::DualSinkUploader;
use item_embedder::util::db::Db;
use item_embedder::util::env;
use item_embedder::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "item-embedder", version, about = "Catalog image embedding pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Embed every catalog item that has no ledger entry yet
    Embed {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Items per encode/upload batch (default: BATCH_SIZE or 32)
        #[arg(long)]
        batch_size: Option<usize>,
        /// This worker's shard, in [0, total_shards)
        #[arg(long, requires = "total_shards")]
        shard_index: Option<u32>,
        /// Number of parallel workers sharing the catalog
        #[arg(long, requires = "shard_index")]
        total_shards: Option<u32>,
        /// Maximum number of candidates to read
        #[arg(long)]
        limit: Option<u64>,
        /// Randomize candidate order (true/false)
        #[arg(long)]
        shuffle: Option<bool>,
    },
    /// Create Qdrant payload indexes (women, category_type, url, price)
    CreatePayloadIndex {
        #[arg(long, value_delimiter = ',', required = true)]
        field: Vec<String>,
    },
    /// Flag embedded items that were sold since as unavailable in Qdrant
    SyncAvailability {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Ids per set-payload request
        #[arg(long, default_value_t = 500)]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Embed {
            db_url,
            batch_size,
            shard_index,
            total_shards,
            limit,
            shuffle,
        } => {
            let overrides = RunOverrides {
                batch_size,
                shard_index,
                total_shards,
                limit,
                shuffle,
            };
            embed(db_url, overrides).await
        }
        Commands::CreatePayloadIndex { field } => create_payload_index(&field).await,
        Commands::SyncAvailability { db_url, chunk_size } => {
            sync_availability(db_url, chunk_size).await
        }
    };
    if let Err(e) = &res {
        error!(error = %format!("{e:#}"), "command failed");
    }
    res
}

async fn connect(db_url: Option<String>, max_connections: u32) -> Result<Db> {
    let url = match db_url {
        Some(u) => u,
        None => env::db_url()?,
    };
    Db::connect(&url, max_connections).await
}

async fn embed(db_url: Option<String>, overrides: RunOverrides) -> Result<()> {
    env::preflight_check(
        "embed",
        &["ENCODER_URL"],
        &[
            "VECTOR_STORE",
            "QDRANT_URL",
            "QDRANT_COLLECTION",
            "PINECONE_HOST",
            "ENCODER_URL",
            "ENCODER_MODEL",
            "EMBED_DIM",
            "BATCH_SIZE",
            "SHARD_INDEX",
            "TOTAL_SHARDS",
            "ITEM_LIMIT",
            "TRAILING_BATCH",
            "FALLBACK_STRATEGY",
        ],
    )?;
    let cfg = RunConfig::from_env(&overrides)?;
    let tables = CatalogTables::from_env()?;
    let store = VectorStoreConfig::from_env()?.build()?;
    let encoder = EncoderConfig::from_env()?.build()?;
    let fetcher = HttpImageFetcher::new(cfg.fetch_timeout)?;

    let db = connect(db_url, cfg.db_max_connections).await?;
    let ledger = PgLedger::new(db.clone(), &tables.ledger)?;
    if cfg.ledger_auto_create {
        ledger.ensure_table().await?;
    }
    let source = PgCandidateSource::new(
        db.clone(),
        &tables,
        CandidateQuery {
            shuffle: cfg.shuffle,
            limit: cfg.limit,
            shard: cfg.shard,
        },
    )?;
    let deleter = PgCatalogDeleter::new(db.clone(), &tables)?;
    let uploader = DualSinkUploader::new(store.as_ref(), &ledger, cfg.fallback.strategy(), cfg.rules);

    info!(
        batch_size = cfg.batch_size,
        shard = ?cfg.shard.map(|s| s.to_string()),
        limit = ?cfg.limit,
        shuffle = cfg.shuffle,
        store = store.name(),
        trailing = ?cfg.trailing,
        fallback = ?cfg.fallback,
        "starting embedding run"
    );
    let summary = Pipeline {
        source: &source,
        fetcher: &fetcher,
        encoder: &encoder,
        uploader: &uploader,
        deleter: &deleter,
        batch_size: cfg.batch_size,
        trailing: cfg.trailing,
    }
    .run()
    .await?;
    info!(
        processed = summary.progress.processed,
        succeeded = summary.progress.succeeded,
        "embedding run complete"
    );
    Ok(())
}

async fn create_payload_index(fields: &[String]) -> Result<()> {
    let qdrant = VectorStoreConfig::qdrant_from_env()?.build_qdrant()?;
    for field in fields {
        qdrant
            .create_payload_index(field.trim())
            .await
            .with_context(|| format!("failed to create payload index for {field}"))?;
    }
    Ok(())
}

async fn sync_availability(db_url: Option<String>, chunk_size: usize) -> Result<()> {
    let tables = CatalogTables::from_env()?;
    let qdrant = VectorStoreConfig::qdrant_from_env()?.build_qdrant()?;
    let db = connect(db_url, env::env_parse("DB_MAX_CONNECTIONS", 2u32)).await?;

    let ids = sold_ledgered_ids(&db, &tables).await?;
    let mut failed = 0usize;
    for chunk in ids.chunks(chunk_size.max(1)) {
        if let Err(e) = qdrant.set_availability(chunk, false).await {
            failed += chunk.len();
            warn!(ids = chunk.len(), error = %format!("{e:#}"), "availability update failed");
        }
    }
    info!(total = ids.len(), failed, "availability sync finished");
    anyhow::ensure!(failed == 0, "{failed} ids could not be flagged unavailable");
    Ok(())
}
