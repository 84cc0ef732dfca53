//! Append-only ledger of `(item_id, point_id)` pairs. Its rows are what keeps
//! an item out of future candidate queries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::QueryBuilder;
use tracing::info;

use crate::catalog::qualified_ident;
use crate::model::LedgerRow;
use crate::sink::{SinkError, SinkName};
use crate::util::db::Db;

/// Postgres caps a statement at 65535 bind parameters; each row binds two.
pub const MAX_ROWS_PER_INSERT: usize = u16::MAX as usize / 2;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Inserts all rows in one statement. Duplicates are tolerated.
    async fn insert(&self, rows: &[LedgerRow]) -> Result<(), SinkError>;
}

pub struct PgLedger {
    db: Db,
    table: String,
}

impl PgLedger {
    pub fn new(db: Db, table: &str) -> Result<Self> {
        Ok(Self {
            db,
            table: qualified_ident(table)?,
        })
    }

    /// Creates the ledger table when it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                item_id BIGINT NOT NULL,
                point_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
            self.table
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.db.pool)
            .await
            .context("failed to create ledger table")?;
        info!(table = %self.table, "ledger table ready");
        Ok(())
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert(&self, rows: &[LedgerRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        if rows.len() > MAX_ROWS_PER_INSERT {
            return Err(SinkError::rejected(
                SinkName::Ledger,
                format!(
                    "{} rows exceed the {MAX_ROWS_PER_INSERT} rows one insert can bind",
                    rows.len()
                ),
            ));
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (item_id, point_id) ", self.table));
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.item_id).push_bind(r.point_id);
        });
        qb.build()
            .persistent(false)
            .execute(&self.db.pool)
            .await
            .map_err(|e| SinkError::from_sqlx(SinkName::Ledger, e))?;
        Ok(())
    }
}
