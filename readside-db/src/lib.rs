//! Database lifecycle management for the read side.
//!
//! Provides schema creation, status checking, and read-model rebuild.

mod schema;

use readside_domain::{AggregateEventTag, Tag};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Create every read-side table that does not exist yet.
///
/// Idempotent: safe to run multiple times, and from several workers at once.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    info!("Initializing read-side schema...");

    let mut tx = pool.begin().await?;
    // Serialize concurrent initializers; CREATE IF NOT EXISTS alone can race on the catalog.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('readside_schema'))")
        .execute(&mut *tx)
        .await?;
    for (_, ddl) in schema::ALL {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!("Schema ready");
    Ok(())
}

/// Progress of one tag: log head versus committed offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLag {
    pub tag: String,
    pub head: i64,
    pub committed: Option<i64>,
}

impl PartitionLag {
    /// Events persisted but not yet applied
    pub fn lag(&self) -> i64 {
        self.head - self.committed.unwrap_or(0)
    }
}

/// Snapshot returned by [`status`].
#[derive(Debug, Clone, Default)]
pub struct SchemaStatus {
    pub missing_tables: Vec<&'static str>,
    pub partitions: Vec<PartitionLag>,
    pub greeting_rows: i64,
    pub live_leases: i64,
}

impl SchemaStatus {
    /// True once every table exists
    pub fn is_initialized(&self) -> bool {
        self.missing_tables.is_empty()
    }
}

/// Check database connectivity, schema presence and projection progress.
///
/// Logs a summary and returns it.
pub async fn status(pool: &PgPool) -> Result<SchemaStatus> {
    // Check connectivity
    let result: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    if result != 1 {
        return Err(anyhow::anyhow!("Database connectivity check failed"));
    }
    info!("Database connectivity: OK");

    let mut report = SchemaStatus::default();
    for (table, _) in schema::ALL {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(pool)
            .await?;
        if !exists {
            report.missing_tables.push(table);
        }
    }

    if !report.is_initialized() {
        warn!(
            missing = ?report.missing_tables,
            "Schema incomplete (run `readsided db init` first)"
        );
        return Ok(report);
    }

    let rows = sqlx::query(
        r#"
        SELECT t.tag, t.last_seq, o.last_offset
        FROM tag_state t
        LEFT JOIN read_side_offsets o ON o.tag = t.tag
        ORDER BY t.tag
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in rows {
        report.partitions.push(PartitionLag {
            tag: row.try_get("tag")?,
            head: row.try_get("last_seq")?,
            committed: row.try_get("last_offset")?,
        });
    }

    report.greeting_rows =
        sqlx::query_scalar("SELECT COUNT(*) FROM user_greetings").fetch_one(pool).await?;
    report.live_leases =
        sqlx::query_scalar("SELECT COUNT(*) FROM read_side_leases WHERE expires_at > NOW()")
            .fetch_one(pool)
            .await?;

    info!(
        greetings = report.greeting_rows,
        live_leases = report.live_leases,
        "Read model status"
    );
    for p in &report.partitions {
        info!(
            "  {}: head={} committed={} lag={}",
            p.tag,
            p.head,
            p.committed.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            p.lag()
        );
    }

    Ok(report)
}

/// Outcome of [`rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildReport {
    pub rows_deleted: u64,
    pub offsets_reset: u64,
}

/// Drop projected rows and offsets so projectors replay from the beginning.
///
/// With `tag`, only rows whose id hashes to that tag and that tag's offset are
/// reset. Refuses to run while a live lease covers an affected tag.
pub async fn rebuild(
    pool: &PgPool,
    tags: &AggregateEventTag,
    tag: Option<&Tag>,
) -> Result<RebuildReport> {
    let mut tx = pool.begin().await?;

    let leased: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM read_side_leases
        WHERE expires_at > NOW()
          AND ($1::VARCHAR IS NULL OR tag = $1)
        "#,
    )
    .bind(tag.map(Tag::as_str))
    .fetch_one(&mut *tx)
    .await?;

    if leased > 0 {
        anyhow::bail!("{} partition(s) still leased; stop workers before rebuilding", leased);
    }

    let report = match tag {
        Some(tag) => {
            let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM user_greetings")
                .fetch_all(&mut *tx)
                .await?;
            let owned: Vec<String> =
                ids.into_iter().filter(|id| &tags.tag_for(id) == tag).collect();

            let rows = sqlx::query("DELETE FROM user_greetings WHERE id = ANY($1)")
                .bind(&owned)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let offsets = sqlx::query("DELETE FROM read_side_offsets WHERE tag = $1")
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();

            RebuildReport { rows_deleted: rows, offsets_reset: offsets }
        },
        None => {
            let rows = sqlx::query("DELETE FROM user_greetings")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            let offsets = sqlx::query("DELETE FROM read_side_offsets")
                .execute(&mut *tx)
                .await?
                .rows_affected();

            RebuildReport { rows_deleted: rows, offsets_reset: offsets }
        },
    };

    tx.commit().await?;

    info!(
        tag = tag.map(Tag::as_str).unwrap_or("*"),
        rows_deleted = report.rows_deleted,
        offsets_reset = report.offsets_reset,
        "Read model rebuild prepared; projectors will replay from the beginning"
    );
    Ok(report)
}

// =============================================================================
// SQLX-TEST: Integration tests require DATABASE_URL
// =============================================================================
