//! Persistence collaborator for agent, task and integration-run records
//!
//! The engine assumes read-after-write consistency and keeps no cache of its
//! own in front of a store.

mod file;
mod memory;
#[cfg(feature = "database")]
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Agent, IntegrationRun, Task};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock acquisition failed: {reason}")]
    Lock { reason: String },

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError>;
    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError>;
    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;
    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<IntegrationRun>, StoreError>;
    async fn put_run(&self, run: &IntegrationRun) -> Result<(), StoreError>;
    /// Runs ordered by start time, optionally limited to one feature
    async fn list_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>, StoreError>;
}

/// Kind names shared by the file and SQLite layouts
pub(crate) const AGENT_KIND: &str = "agents";
pub(crate) const TASK_KIND: &str = "tasks";
pub(crate) const RUN_KIND: &str = "runs";

pub(crate) fn sort_runs(runs: &mut [IntegrationRun]) {
    runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
}
