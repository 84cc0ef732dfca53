//! Candidate selection against the relational catalog.
//!
//! A candidate is the latest row per `vinted_id` that has no ledger entry and
//! is not listed as sold. Sharding is applied on the row stream with
//! [`crate::shard`], so the partition does not depend on a database-side hash.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::model::CandidateItem;
use crate::shard::Shard;
use crate::sweep::ItemDeleter;
use crate::util::db::Db;
use crate::util::env::env_opt;

/// Names of the catalog tables, validated as (optionally schema-qualified) identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTables {
    pub item: String,
    pub image: String,
    pub category: String,
    pub catalog: String,
    pub sold: String,
    pub ledger: String,
}

impl Default for CatalogTables {
    fn default() -> Self {
        Self {
            item: "item".into(),
            image: "image".into(),
            category: "category".into(),
            catalog: "catalog".into(),
            sold: "sold".into(),
            ledger: "embedded_points".into(),
        }
    }
}

impl CatalogTables {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let tables = Self {
            item: env_opt("CATALOG_ITEM_TABLE").unwrap_or(d.item),
            image: env_opt("CATALOG_IMAGE_TABLE").unwrap_or(d.image),
            category: env_opt("CATALOG_CATEGORY_TABLE").unwrap_or(d.category),
            catalog: env_opt("CATALOG_CATALOG_TABLE").unwrap_or(d.catalog),
            sold: env_opt("CATALOG_SOLD_TABLE").unwrap_or(d.sold),
            ledger: env_opt("LEDGER_TABLE").unwrap_or(d.ledger),
        };
        tables.validate()?;
        Ok(tables)
    }

    pub fn validate(&self) -> Result<()> {
        for name in [
            &self.item,
            &self.image,
            &self.category,
            &self.catalog,
            &self.sold,
            &self.ledger,
        ] {
            qualified_ident(name)?;
        }
        Ok(())
    }
}

/// Quotes a `table` or `schema.table` name after checking every part is a plain identifier.
pub fn qualified_ident(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.trim().split('.').collect();
    anyhow::ensure!(
        !parts.is_empty() && parts.len() <= 2,
        "invalid table name {name:?}"
    );
    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        anyhow::ensure!(
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit()),
            "invalid identifier {part:?} in table name {name:?}"
        );
        quoted.push(format!("\"{part}\""));
    }
    Ok(quoted.join("."))
}

/// Selection parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidateQuery {
    pub shuffle: bool,
    pub limit: Option<u64>,
    pub shard: Option<Shard>,
}

/// Renders the candidate query. The row cap is pushed into SQL only when
/// there is no shard filter; otherwise it is applied after filtering.
pub fn render_candidate_sql(tables: &CatalogTables, query: &CandidateQuery) -> Result<String> {
    let item = qualified_ident(&tables.item)?;
    let image = qualified_ident(&tables.image)?;
    let category = qualified_ident(&tables.category)?;
    let catalog = qualified_ident(&tables.catalog)?;
    let sold = qualified_ident(&tables.sold)?;
    let ledger = qualified_ident(&tables.ledger)?;

    let mut sql = format!(
        r#"WITH latest AS (
    SELECT DISTINCT ON (it.vinted_id)
        it.id::bigint AS id,
        it.vinted_id::text AS vinted_id,
        it.url::text AS url,
        img.url AS image_location,
        it.catalog_id::bigint AS catalog_id,
        cat.category_type AS category_type,
        cl.women AS women,
        it.price::float8 AS price,
        it.created_at AS created_at
    FROM {item} it
    LEFT JOIN {image} img ON img.vinted_id = it.vinted_id
    LEFT JOIN {category} cat ON cat.catalog_id = it.catalog_id
    LEFT JOIN {catalog} cl ON cl.id = it.catalog_id
    WHERE NOT EXISTS (SELECT 1 FROM {ledger} l WHERE l.item_id = it.id)
      AND NOT EXISTS (SELECT 1 FROM {sold} s WHERE s.vinted_id::text = it.vinted_id::text)
    ORDER BY it.vinted_id, it.created_at DESC NULLS LAST, it.id DESC, img.url
)
SELECT id, vinted_id, url, image_location, catalog_id, category_type, women, price, created_at
FROM latest"#
    );
    if query.shuffle {
        sql.push_str("\nORDER BY random()");
    } else {
        sql.push_str("\nORDER BY created_at DESC NULLS LAST, id DESC");
    }
    if let (Some(limit), None) = (query.limit, query.shard) {
        sql.push_str(&format!("\nLIMIT {limit}"));
    }
    Ok(sql)
}

/// Applies the shard predicate and then the row cap to a candidate stream.
pub fn scope_candidates<'a>(
    rows: BoxStream<'a, Result<CandidateItem>>,
    shard: Option<Shard>,
    limit: Option<u64>,
) -> BoxStream<'a, Result<CandidateItem>> {
    let filtered = match shard {
        Some(shard) => rows
            .try_filter(move |item| future::ready(shard.contains(&item.vinted_id)))
            .boxed(),
        None => rows,
    };
    match limit {
        Some(n) => filtered
            .take(usize::try_from(n).unwrap_or(usize::MAX))
            .boxed(),
        None => filtered,
    }
}

/// Lazy, finite, single-pass sequence of candidates.
pub trait CandidateSource: Send + Sync {
    fn candidates(&self) -> BoxStream<'_, Result<CandidateItem>>;
}

pub struct PgCandidateSource {
    db: Db,
    query: CandidateQuery,
    sql: String,
}

impl PgCandidateSource {
    pub fn new(db: Db, tables: &CatalogTables, query: CandidateQuery) -> Result<Self> {
        let sql = render_candidate_sql(tables, &query)?;
        debug!(%sql, "candidate query rendered");
        Ok(Self { db, query, sql })
    }
}

impl CandidateSource for PgCandidateSource {
    fn candidates(&self) -> BoxStream<'_, Result<CandidateItem>> {
        let rows = sqlx::query_as::<_, CandidateItem>(&self.sql)
            .persistent(false)
            .fetch(&self.db.pool)
            .map_err(|e| anyhow::Error::new(e).context("candidate query failed"))
            .boxed();
        scope_candidates(rows, self.query.shard, self.query.limit)
    }
}

/// Deletes undeliverable items from the active-items table.
pub struct PgCatalogDeleter {
    db: Db,
    item_table: String,
}

impl PgCatalogDeleter {
    pub fn new(db: Db, tables: &CatalogTables) -> Result<Self> {
        Ok(Self {
            db,
            item_table: qualified_ident(&tables.item)?,
        })
    }
}

#[async_trait]
impl ItemDeleter for PgCatalogDeleter {
    async fn delete_items(&self, vinted_ids: &[String]) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE vinted_id::text = ANY($1)",
            self.item_table
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(vinted_ids)
            .execute(&self.db.pool)
            .await
            .context("catalog delete failed")?;
        Ok(res.rows_affected())
    }
}

/// Catalog ids that have a ledger entry but have since been sold.
pub async fn sold_ledgered_ids(db: &Db, tables: &CatalogTables) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT it.vinted_id::text FROM {item} it \
         JOIN {ledger} l ON l.item_id = it.id \
         JOIN {sold} s ON s.vinted_id::text = it.vinted_id::text",
        item = qualified_ident(&tables.item)?,
        ledger = qualified_ident(&tables.ledger)?,
        sold = qualified_ident(&tables.sold)?,
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql)
        .persistent(false)
        .fetch_all(&db.pool)
        .await
        .context("sold item lookup failed")?;
    info!(count = ids.len(), "sold items with embeddings");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_item;
    use futures::stream;

    fn rows(n: i64) -> BoxStream<'static, Result<CandidateItem>> {
        stream::iter((1..=n).map(|i| Ok(sample_item(i)))).boxed()
    }

    #[test]
    fn sql_excludes_ledger_and_sold_rows() {
        let sql = render_candidate_sql(&CatalogTables::default(), &CandidateQuery::default())
            .unwrap();
        assert!(sql.contains(r#"NOT EXISTS (SELECT 1 FROM "embedded_points" l WHERE l.item_id = it.id)"#));
        assert!(sql.contains(r#"FROM "sold" s"#));
        assert!(sql.contains("DISTINCT ON (it.vinted_id)"));
        assert!(sql.contains("it.url::text AS url"));
        assert!(sql.contains("ORDER BY created_at DESC NULLS LAST"));
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn sql_shuffle_and_limit() {
        let q = CandidateQuery {
            shuffle: true,
            limit: Some(100),
            shard: None,
        };
        let sql = render_candidate_sql(&CatalogTables::default(), &q).unwrap();
        assert!(sql.contains("ORDER BY random()"));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn sharded_limit_is_not_pushed_into_sql() {
        let q = CandidateQuery {
            shuffle: false,
            limit: Some(10),
            shard: Some(Shard::new(1, 3).unwrap()),
        };
        let sql = render_candidate_sql(&CatalogTables::default(), &q).unwrap();
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn rejects_injected_table_names() {
        assert!(qualified_ident("item; DROP TABLE x").is_err());
        assert!(qualified_ident("a.b.c").is_err());
        assert!(qualified_ident("1item").is_err());
        assert_eq!(qualified_ident("vinted.item").unwrap(), r#""vinted"."item""#);
        let tables = CatalogTables {
            ledger: "bad-name".into(),
            ..CatalogTables::default()
        };
        assert!(tables.validate().is_err());
    }

    #[tokio::test]
    async fn shard_scope_only_yields_owned_ids() {
        let shard = Shard::new(2, 4).unwrap();
        let out: Vec<CandidateItem> = scope_candidates(rows(400), Some(shard), None)
            .try_collect()
            .await
            .unwrap();
        assert!(!out.is_empty());
        assert!(out.iter().all(|i| crate::shard::assign(&i.vinted_id, 2, 4)));
        let expected = (1..=400)
            .filter(|i| crate::shard::assign(&format!("v{i}"), 2, 4))
            .count();
        assert_eq!(out.len(), expected);
    }

    #[tokio::test]
    async fn shards_union_to_the_unsharded_set() {
        let mut seen: Vec<i64> = Vec::new();
        for index in 0..4 {
            let shard = Shard::new(index, 4).unwrap();
            let part: Vec<CandidateItem> = scope_candidates(rows(200), Some(shard), None)
                .try_collect()
                .await
                .unwrap();
            seen.extend(part.iter().map(|i| i.id));
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn limit_applies_after_shard_filter() {
        let shard = Shard::new(0, 2).unwrap();
        let out: Vec<CandidateItem> = scope_candidates(rows(500), Some(shard), Some(5))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|i| shard.contains(&i.vinted_id)));
    }
}
