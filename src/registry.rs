//! Active agents and the per-agent lock table
//!
//! Every mutation of one agent's records (workspace, agent, current task)
//! runs under that agent's lock. There is no lock across agents.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{Agent, AgentView};
use crate::store::RecordStore;
use crate::workspace::WorkspaceManager;

/// One async mutex per key, created on first use
#[derive(Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            // The table is only touched between awaits, so a poisoned
            // std mutex still holds a consistent map.
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct AgentRegistry {
    store: Arc<dyn RecordStore>,
    workspaces: Arc<WorkspaceManager>,
    locks: KeyedLocks,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn RecordStore>, workspaces: Arc<WorkspaceManager>) -> Self {
        Self {
            store,
            workspaces,
            locks: KeyedLocks::new(),
        }
    }

    /// Exclusive access to one agent's records
    pub async fn lock(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(agent_id).await
    }

    /// Mark the agent active. Re-activation overwrites the capability set.
    pub async fn activate(&self, agent_id: &str, capabilities: BTreeSet<String>) -> Result<()> {
        let _guard = self.lock(agent_id).await;

        let workspace = self.workspaces.get(agent_id).await.ok_or_else(|| EngineError::NoWorkspace {
            agent: agent_id.to_string(),
        })?;

        let agent = match self.store.get_agent(agent_id).await? {
            Some(mut existing) => {
                debug!(agent_id = %agent_id, "Re-activating agent, replacing capabilities");
                existing.capabilities = capabilities;
                existing.workspace = Some(workspace.path.clone());
                existing.feature_id = Some(workspace.feature_id.clone());
                existing
            }
            None => Agent {
                id: agent_id.to_string(),
                capabilities,
                current_task: None,
                workspace: Some(workspace.path.clone()),
                feature_id: Some(workspace.feature_id.clone()),
                activated_at: Utc::now(),
            },
        };

        self.store.put_agent(&agent).await?;
        info!(
            agent_id = %agent_id,
            feature_id = %workspace.feature_id,
            capabilities = ?agent.capabilities,
            "Agent activated"
        );
        Ok(())
    }

    /// Snapshot of agent and workspace state; `None` if neither exists
    pub async fn status(&self, agent_id: &str) -> Result<Option<AgentView>> {
        let agent = self.store.get_agent(agent_id).await?;
        let workspace = self.workspaces.get(agent_id).await;

        if agent.is_none() && workspace.is_none() {
            return Ok(None);
        }

        Ok(Some(match agent {
            Some(agent) => AgentView {
                agent_id: agent.id,
                active: true,
                capabilities: agent.capabilities,
                current_task: agent.current_task,
                activated_at: Some(agent.activated_at),
                workspace,
            },
            None => AgentView {
                agent_id: agent_id.to_string(),
                active: false,
                capabilities: BTreeSet::new(),
                current_task: None,
                activated_at: None,
                workspace,
            },
        }))
    }

    /// Clear the agent's state. Refused while a non-terminal task is held.
    pub async fn deactivate(&self, agent_id: &str) -> Result<()> {
        let _guard = self.lock(agent_id).await;
        self.deactivate_locked(agent_id).await
    }

    /// `deactivate` for callers already holding the agent lock
    pub(crate) async fn deactivate_locked(&self, agent_id: &str) -> Result<()> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            debug!(agent_id = %agent_id, "Agent not active, nothing to deactivate");
            return Ok(());
        };

        if let Some(task_id) = &agent.current_task {
            let open = match self.store.get_task(task_id).await? {
                Some(task) => !task.status.is_terminal(),
                None => true,
            };
            if open {
                return Err(EngineError::ActiveTask {
                    agent: agent_id.to_string(),
                    task: task_id.clone(),
                });
            }
        }

        self.store.delete_agent(agent_id).await?;
        info!(agent_id = %agent_id, "Agent deactivated");
        Ok(())
    }
}
