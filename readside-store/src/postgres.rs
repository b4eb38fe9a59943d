//! PostgreSQL offset store, read model and partition coordinator.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.
//! Tables are created by `readside_db::init_schema`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use readside_domain::{Lease, Offset, Tag, UserGreeting, WorkerId};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::repository::{
    check_monotonic, AcquireOutcome, GreetingRepository, OffsetStore, PartitionCoordinator,
    RenewOutcome, RowMutation, WriteBatch,
};

// =============================================================================
// PgStore
// =============================================================================

/// PostgreSQL adapter for `read_side_offsets` and `user_greetings`.
///
/// Every commit is one SQL transaction: a compare-and-set on the offset row
/// first (which also locks it), then the row mutations.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OffsetStore for PgStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        readside_db::init_schema(&self.pool)
            .await
            .map_err(|e| StoreError::SchemaInit(format!("{:#}", e)))
    }

    async fn load(&self, tag: &Tag) -> Result<Option<Offset>, StoreError> {
        let offset: Option<i64> =
            sqlx::query_scalar("SELECT last_offset FROM read_side_offsets WHERE tag = $1")
                .bind(tag.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(offset.map(Offset::new).transpose()?)
    }

    async fn commit(
        &self,
        tag: &Tag,
        expected: Option<Offset>,
        new: Offset,
        batch: WriteBatch,
    ) -> Result<(), StoreError> {
        check_monotonic(tag, expected, new)?;

        let mut tx = self.pool.begin().await?;

        let swapped = match expected {
            None => sqlx::query(
                r#"
                INSERT INTO read_side_offsets (tag, last_offset, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (tag) DO NOTHING
                "#,
            )
            .bind(tag.as_str())
            .bind(new.value())
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(expected) => sqlx::query(
                r#"
                UPDATE read_side_offsets
                SET last_offset = $3, updated_at = NOW()
                WHERE tag = $1 AND last_offset = $2
                "#,
            )
            .bind(tag.as_str())
            .bind(expected.value())
            .bind(new.value())
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if swapped != 1 {
            let actual = current_offset(&mut tx, tag).await?;
            tx.rollback().await?;
            return Err(StoreError::StaleOffset { tag: tag.clone(), expected, actual });
        }

        for mutation in batch {
            apply_mutation(&mut tx, mutation, new).await?;
        }

        tx.commit().await?;

        debug!(tag = %tag, offset = %new, "Committed");
        Ok(())
    }
}

async fn current_offset(
    tx: &mut Transaction<'_, Postgres>,
    tag: &Tag,
) -> Result<Option<Offset>, StoreError> {
    let offset: Option<i64> =
        sqlx::query_scalar("SELECT last_offset FROM read_side_offsets WHERE tag = $1")
            .bind(tag.as_str())
            .fetch_optional(&mut **tx)
            .await?;

    Ok(offset.map(Offset::new).transpose()?)
}

async fn apply_mutation(
    tx: &mut Transaction<'_, Postgres>,
    mutation: RowMutation,
    offset: Offset,
) -> Result<(), StoreError> {
    match mutation {
        RowMutation::UpsertGreeting(greeting) => {
            sqlx::query(
                r#"
                INSERT INTO user_greetings (id, message, last_offset, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    message = EXCLUDED.message,
                    last_offset = EXCLUDED.last_offset,
                    updated_at = NOW()
                "#,
            )
            .bind(&greeting.id)
            .bind(&greeting.message)
            .bind(offset.value())
            .execute(&mut **tx)
            .await?;
        },
        RowMutation::DeleteGreeting { id } => {
            sqlx::query("DELETE FROM user_greetings WHERE id = $1")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
        },
    }
    Ok(())
}

#[async_trait]
impl GreetingRepository for PgStore {
    async fn find_greeting(&self, id: &str) -> Result<Option<UserGreeting>, StoreError> {
        let row = sqlx::query("SELECT id, message FROM user_greetings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| greeting_from_row(&r)).transpose()
    }

    async fn all_greetings(&self) -> Result<Vec<UserGreeting>, StoreError> {
        let rows = sqlx::query("SELECT id, message FROM user_greetings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(greeting_from_row).collect()
    }
}

fn greeting_from_row(row: &sqlx::postgres::PgRow) -> Result<UserGreeting, StoreError> {
    Ok(UserGreeting { id: row.try_get("id")?, message: row.try_get("message")? })
}

// =============================================================================
// PgCoordinator
// =============================================================================

/// Lease table coordinator. Each operation is a single conditional statement,
/// so concurrent workers serialize on the tag row.
#[derive(Clone)]
pub struct PgCoordinator {
    pool: PgPool,
}

impl PgCoordinator {
    /// Create a new PostgreSQL coordinator.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl PartitionCoordinator for PgCoordinator {
    async fn acquire(
        &self,
        tag: &Tag,
        worker_id: &WorkerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreError> {
        loop {
            let token = Uuid::now_v7();
            let acquired_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                r#"
                INSERT INTO read_side_leases (tag, worker_id, token, ttl_ms, expires_at, acquired_at)
                VALUES ($1, $2, $3, $4, NOW() + $4::FLOAT8 * INTERVAL '1 millisecond', NOW())
                ON CONFLICT (tag) DO UPDATE SET
                    worker_id = EXCLUDED.worker_id,
                    token = EXCLUDED.token,
                    ttl_ms = EXCLUDED.ttl_ms,
                    expires_at = EXCLUDED.expires_at,
                    acquired_at = EXCLUDED.acquired_at
                WHERE read_side_leases.expires_at <= NOW()
                   OR read_side_leases.worker_id = EXCLUDED.worker_id
                RETURNING acquired_at
                "#,
            )
            .bind(tag.as_str())
            .bind(worker_id.as_str())
            .bind(token)
            .bind(ttl_millis(ttl))
            .fetch_optional(&self.pool)
            .await?;

            if let Some(acquired_at) = acquired_at {
                debug!(tag = %tag, worker = %worker_id, "Lease acquired");
                return Ok(AcquireOutcome::Acquired(Lease {
                    tag: tag.clone(),
                    worker_id: worker_id.clone(),
                    token,
                    ttl,
                    acquired_at,
                }));
            }

            let holder: Option<String> = sqlx::query_scalar(
                "SELECT worker_id FROM read_side_leases WHERE tag = $1 AND expires_at > NOW()",
            )
            .bind(tag.as_str())
            .fetch_optional(&self.pool)
            .await?;

            // The holder's lease lapsed between the two statements; try again.
            if let Some(holder) = holder {
                return Ok(AcquireOutcome::Busy { holder: WorkerId::new(holder)? });
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, StoreError> {
        let renewed = sqlx::query(
            r#"
            UPDATE read_side_leases
            SET expires_at = NOW() + ttl_ms::FLOAT8 * INTERVAL '1 millisecond'
            WHERE tag = $1 AND token = $2 AND expires_at > NOW()
            "#,
        )
        .bind(lease.tag.as_str())
        .bind(lease.token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if renewed == 1 {
            Ok(RenewOutcome::Renewed(lease.clone()))
        } else {
            Ok(RenewOutcome::Expired)
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let released = sqlx::query("DELETE FROM read_side_leases WHERE tag = $1 AND token = $2")
            .bind(lease.tag.as_str())
            .bind(lease.token)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if released == 1 {
            debug!(tag = %lease.tag, worker = %lease.worker_id, "Lease released");
        }
        Ok(())
    }

    async fn leases(&self) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tag, worker_id, token, ttl_ms, acquired_at
            FROM read_side_leases
            WHERE expires_at > NOW()
            ORDER BY tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Lease, StoreError> {
                let ttl_ms: i64 = row.try_get("ttl_ms")?;
                Ok(Lease {
                    tag: Tag::new(row.try_get::<String, _>("tag")?)?,
                    worker_id: WorkerId::new(row.try_get::<String, _>("worker_id")?)?,
                    token: row.try_get("token")?,
                    ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
                    acquired_at: row.try_get("acquired_at")?,
                })
            })
            .collect()
    }
}
