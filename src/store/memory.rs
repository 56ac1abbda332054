use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{sort_runs, RecordStore, StoreError};
use crate::models::{Agent, IntegrationRun, Task};

/// In-process store; the default when no persistence is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<String, Agent>>,
    tasks: RwLock<HashMap<String, Task>>,
    runs: RwLock<HashMap<String, IntegrationRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.agents.write().await.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        self.agents.write().await.remove(agent_id);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<IntegrationRun>, StoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn put_run(&self, run: &IntegrationRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>, StoreError> {
        let mut runs: Vec<IntegrationRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| feature_id.map_or(true, |f| r.feature_id == f))
            .cloned()
            .collect();
        sort_runs(&mut runs);
        Ok(runs)
    }
}
