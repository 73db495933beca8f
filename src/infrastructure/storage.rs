use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::warn;

use crate::domain::{SetCounter, StatsDelta, StatusDelta};
use crate::infrastructure::error::StorageError;

/// Applies one merged delta for one key. Implementations must be safe to call
/// concurrently for different keys.
#[async_trait]
pub trait DeltaWriter<K, D>: Send + Sync
where
    K: Send + Sync,
    D: Send + Sync,
{
    async fn apply(&self, key: &K, delta: &D) -> Result<(), StorageError>;
}

fn warn_if_missing(table: &str, key: i64, rows_affected: u64) {
    // The entity is gone; redelivery would not change that, so the write
    // still counts as done.
    if rows_affected == 0 {
        warn!("No row in {} for id {}, delta dropped", table, key);
    }
}

/// `UPDATE <table> SET <column> = $1 WHERE <id_column> = $2`
#[derive(Clone)]
pub struct PgCounterWriter {
    pool: Arc<PgPool>,
    table: &'static str,
    id_column: &'static str,
    column: &'static str,
}

impl PgCounterWriter {
    pub fn new(
        pool: Arc<PgPool>,
        table: &'static str,
        id_column: &'static str,
        column: &'static str,
    ) -> Self {
        Self {
            pool,
            table,
            id_column,
            column,
        }
    }

    fn statement(&self) -> String {
        format!(
            "UPDATE {} SET {} = $1 WHERE {} = $2",
            self.table, self.column, self.id_column
        )
    }
}

#[async_trait]
impl DeltaWriter<i64, SetCounter> for PgCounterWriter {
    async fn apply(&self, key: &i64, delta: &SetCounter) -> Result<(), StorageError> {
        let result = sqlx::query(&self.statement())
            .bind(delta.value)
            .bind(*key)
            .execute(&*self.pool)
            .await?;
        warn_if_missing(self.table, *key, result.rows_affected());
        Ok(())
    }
}

/// Writes only the engagement columns present in the delta.
#[derive(Clone)]
pub struct PgStatsWriter {
    pool: Arc<PgPool>,
    table: &'static str,
    id_column: &'static str,
}

impl PgStatsWriter {
    pub fn new(pool: Arc<PgPool>, table: &'static str, id_column: &'static str) -> Self {
        Self {
            pool,
            table,
            id_column,
        }
    }

    fn build<'a>(&self, key: i64, delta: &StatsDelta) -> Result<QueryBuilder<'a, Postgres>, StorageError> {
        let columns = delta.columns();
        if columns.is_empty() {
            return Err(StorageError::EmptyDelta(key.to_string()));
        }

        let mut builder = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", self.table));
        let mut assignments = builder.separated(", ");
        for (column, value) in columns {
            assignments.push(format!("{} = ", column));
            assignments.push_bind_unseparated(value);
        }
        builder.push(format!(" WHERE {} = ", self.id_column));
        builder.push_bind(key);
        Ok(builder)
    }
}

#[async_trait]
impl DeltaWriter<i64, StatsDelta> for PgStatsWriter {
    async fn apply(&self, key: &i64, delta: &StatsDelta) -> Result<(), StorageError> {
        let mut builder = self.build(*key, delta)?;
        let result = builder.build().execute(&*self.pool).await?;
        warn_if_missing(self.table, *key, result.rows_affected());
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgCreatorStatusWriter {
    pool: Arc<PgPool>,
}

impl PgCreatorStatusWriter {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeltaWriter<i64, StatusDelta> for PgCreatorStatusWriter {
    async fn apply(&self, key: &i64, delta: &StatusDelta) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE creators SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(delta.status.as_str())
            .bind(*key)
            .execute(&*self.pool)
            .await?;
        warn_if_missing("creators", *key, result.rows_affected());
        Ok(())
    }
}
