//! PostgreSQL task store.
//!
//! Enable with the `postgres` feature flag.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{StorageResultExt, StoreError, StoreResult, TaskStore};
use crate::tasks::{TaskPatch, TaskRecord, TaskStatus, TaskUpdate};
use crate::types::TaskId;

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub table_name: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table_name: "agent_tasks".to_string(),
            max_connections: 10,
        }
    }
}

pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    config: PostgresConfig,
}

impl PostgresTaskStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect_with_config(database_url, PostgresConfig::default()).await
    }

    pub async fn connect_with_config(
        database_url: &str,
        config: PostgresConfig,
    ) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            config,
        })
    }

    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            config: PostgresConfig::default(),
        }
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = name.into();
        self
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let table = &self.config.table_name;
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                task_name VARCHAR(255) NOT NULL,
                queue_name VARCHAR(255) NOT NULL,
                status VARCHAR(32) NOT NULL,
                user_id VARCHAR(255),
                data JSONB NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table} (status);
            CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table} (user_id);
            "#
        );
        sqlx::raw_sql(&query).execute(&*self.pool).await?;
        Ok(())
    }

    fn decode(row: &sqlx::postgres::PgRow) -> StoreResult<TaskRecord> {
        let data: serde_json::Value = row.try_get("data").storage_err()?;
        Ok(serde_json::from_value(data)?)
    }

    async fn write_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &TaskRecord,
    ) -> StoreResult<u64> {
        let query = format!(
            "UPDATE {} SET status = $2, data = $3, updated_at = NOW() WHERE id = $1",
            self.config.table_name
        );
        let result = sqlx::query(&query)
            .bind(record.id.0)
            .bind(record.status.as_str())
            .bind(serde_json::to_value(record)?)
            .execute(&mut **tx)
            .await
            .storage_err()?;
        Ok(result.rows_affected())
    }

    async fn lock_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: &TaskId,
    ) -> StoreResult<Option<TaskRecord>> {
        let query = format!(
            "SELECT data FROM {} WHERE id = $1 FOR UPDATE",
            self.config.table_name
        );
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await
            .storage_err()?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_where(&self, column: &str, value: &str) -> StoreResult<Vec<TaskRecord>> {
        let query = format!(
            "SELECT data FROM {} WHERE {} = $1 ORDER BY enqueued_at",
            self.config.table_name, column
        );
        let rows = sqlx::query(&query)
            .bind(value)
            .fetch_all(&*self.pool)
            .await
            .storage_err()?;
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn create(&self, record: &TaskRecord) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, task_name, queue_name, status, user_id, data, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            self.config.table_name
        );
        sqlx::query(&query)
            .bind(record.id.0)
            .bind(&record.task_name)
            .bind(&record.queue_name)
            .bind(record.status.as_str())
            .bind(&record.user_id)
            .bind(serde_json::to_value(record)?)
            .bind(record.enqueued_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Unavailable {
                    message: e.to_string(),
                },
                other => StoreError::Storage {
                    message: other.to_string(),
                },
            })?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        let query = format!("SELECT data FROM {} WHERE id = $1", self.config.table_name);
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .storage_err()?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> StoreResult<Option<TaskRecord>> {
        let mut tx = self.pool.begin().await.storage_err()?;
        let Some(mut record) = self.lock_row(&mut tx, id).await? else {
            return Ok(None);
        };
        patch.apply(&mut record);
        self.write_row(&mut tx, &record).await?;
        tx.commit().await.storage_err()?;
        Ok(Some(record))
    }

    async fn bulk_update(&self, updates: &[TaskUpdate]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.storage_err()?;
        let mut matched = 0;
        for update in updates {
            if let Some(mut record) = self.lock_row(&mut tx, &update.id).await? {
                update.patch.apply(&mut record);
                matched += self.write_row(&mut tx, &record).await?;
            }
        }
        // Dropping `tx` on an earlier `?` rolls the whole batch back.
        tx.commit().await.storage_err()?;
        Ok(matched)
    }

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        self.list_where("status", status.as_str()).await
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<TaskRecord>> {
        self.list_where("user_id", user_id).await
    }
}
