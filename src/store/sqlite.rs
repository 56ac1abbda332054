use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::{sort_runs, RecordStore, StoreError, AGENT_KIND, RUN_KIND, TASK_KIND};
use crate::models::{Agent, IntegrationRun, Task};

/// SQLite-backed store. Every record is a JSON body in one `records` table
/// keyed by (kind, id).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect, creating the database file and schema if missing
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        if !database_url.contains(":memory:") && !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn read<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>, StoreError> {
        let row = sqlx::query("SELECT body FROM records WHERE kind = ?1 AND id = ?2")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, kind: &str, id: &str, record: &T) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO records (kind, id, body, updated_at)
            VALUES (?1, ?2, ?3, datetime('now'))
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        self.read(AGENT_KIND, agent_id).await
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.write(AGENT_KIND, &agent.id, agent).await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE kind = ?1 AND id = ?2")
            .bind(AGENT_KIND)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.read(TASK_KIND, task_id).await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.write(TASK_KIND, &task.id, task).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<IntegrationRun>, StoreError> {
        self.read(RUN_KIND, run_id).await
    }

    async fn put_run(&self, run: &IntegrationRun) -> Result<(), StoreError> {
        self.write(RUN_KIND, &run.id, run).await
    }

    async fn list_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>, StoreError> {
        let rows = sqlx::query("SELECT body FROM records WHERE kind = ?1")
            .bind(RUN_KIND)
            .fetch_all(&self.pool)
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            let run: IntegrationRun = serde_json::from_str(&body)?;
            if feature_id.map_or(true, |f| run.feature_id == f) {
                runs.push(run);
            }
        }
        sort_runs(&mut runs);
        Ok(runs)
    }
}
