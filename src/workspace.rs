//! Per-(agent, feature) worktrees
//!
//! The manager owns only workspace bookkeeping; every side effect is a
//! backend command. Callers serialize create/remove per agent (the engine
//! does this through the registry's agent locks).

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::external::git::{GitError, VersionControl, WorktreeEntry};
use crate::models::{AgentId, Workspace};
use crate::observability::OperationTimer;

#[derive(Default)]
struct WorkspaceTable {
    by_agent: HashMap<AgentId, Workspace>,
    /// Paths held by tracked workspaces and by creations still in flight
    paths: HashMap<PathBuf, AgentId>,
}

pub struct WorkspaceManager {
    backend: Arc<dyn VersionControl>,
    worktree_root: PathBuf,
    base_branch: String,
    force_remove: bool,
    table: RwLock<WorkspaceTable>,
}

impl WorkspaceManager {
    pub fn new(backend: Arc<dyn VersionControl>, worktree_root: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            backend,
            worktree_root: worktree_root.into(),
            base_branch: base_branch.into(),
            force_remove: false,
            table: RwLock::new(WorkspaceTable::default()),
        }
    }

    pub fn with_force_remove(mut self, force: bool) -> Self {
        self.force_remove = force;
        self
    }

    /// Deterministic location for an (agent, feature) pair
    pub fn workspace_path(&self, agent_id: &str, feature_id: &str) -> PathBuf {
        self.worktree_root
            .join(format!("{}_{}", path_component(agent_id), path_component(feature_id)))
    }

    /// Create the agent's workspace on a new branch.
    ///
    /// Calling again for the same (agent, feature) returns the existing path
    /// without touching the backend.
    pub async fn create(&self, agent_id: &str, feature_id: &str, branch: &str) -> Result<PathBuf> {
        let path = self.workspace_path(agent_id, feature_id);

        {
            let mut table = self.table.write().await;
            if let Some(existing) = table.by_agent.get(agent_id) {
                if existing.feature_id == feature_id {
                    debug!(agent_id = %agent_id, feature_id = %feature_id, "Workspace already exists");
                    return Ok(existing.path.clone());
                }
                return Err(EngineError::WorkspaceConflict {
                    agent: agent_id.to_string(),
                    detail: format!("already holds a workspace for feature {}", existing.feature_id),
                });
            }
            if let Some(holder) = table.paths.get(&path) {
                return Err(EngineError::WorkspaceConflict {
                    agent: agent_id.to_string(),
                    detail: format!("path {} is held by agent {holder}", path.display()),
                });
            }
            table.paths.insert(path.clone(), agent_id.to_string());
        }

        let timer = OperationTimer::new("workspace.create");
        let created = self.backend.add_worktree(&path, branch, &self.base_branch).await;
        let startup = timer.finish();

        let mut table = self.table.write().await;
        if let Err(e) = created {
            table.paths.remove(&path);
            warn!(agent_id = %agent_id, feature_id = %feature_id, branch = %branch, error = %e, "Workspace creation failed");
            return Err(EngineError::WorkspaceCreation {
                agent: agent_id.to_string(),
                diagnostic: e.to_string(),
            });
        }

        table.by_agent.insert(
            agent_id.to_string(),
            Workspace {
                agent_id: agent_id.to_string(),
                feature_id: feature_id.to_string(),
                path: path.clone(),
                branch: branch.to_string(),
                created_at: Utc::now(),
                startup_duration_ms: startup.as_millis() as u64,
            },
        );

        info!(
            agent_id = %agent_id,
            feature_id = %feature_id,
            branch = %branch,
            worktree_path = %path.display(),
            "Workspace created"
        );
        Ok(path)
    }

    /// Remove the agent's workspace. No tracked workspace is a no-op.
    ///
    /// Tracking is cleared only once the backend confirms the removal (or
    /// reports the worktree already gone).
    pub async fn remove(&self, agent_id: &str) -> Result<()> {
        let Some(workspace) = self.get(agent_id).await else {
            debug!(agent_id = %agent_id, "No workspace to remove");
            return Ok(());
        };

        match self.backend.remove_worktree(&workspace.path, self.force_remove).await {
            Ok(()) => {}
            Err(GitError::WorktreeNotFound { .. }) => {
                warn!(agent_id = %agent_id, worktree_path = %workspace.path.display(), "Worktree already gone, dropping tracking");
            }
            Err(e) => {
                return Err(EngineError::WorkspaceRemoval {
                    agent: agent_id.to_string(),
                    diagnostic: e.to_string(),
                });
            }
        }

        let mut table = self.table.write().await;
        table.by_agent.remove(agent_id);
        table.paths.remove(&workspace.path);
        info!(agent_id = %agent_id, worktree_path = %workspace.path.display(), "Workspace removed");
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Workspace> {
        self.table.read().await.by_agent.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Workspace> {
        let mut workspaces: Vec<Workspace> = self.table.read().await.by_agent.values().cloned().collect();
        workspaces.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        workspaces
    }

    /// Stage and commit everything in the agent's workspace
    pub async fn commit(&self, agent_id: &str, message: &str) -> Result<()> {
        let workspace = self.get(agent_id).await.ok_or_else(|| EngineError::NoWorkspace {
            agent: agent_id.to_string(),
        })?;
        self.backend.commit_all(&workspace.path, message).await?;
        debug!(agent_id = %agent_id, worktree_path = %workspace.path.display(), "Workspace committed");
        Ok(())
    }

    /// Worktrees as the backend sees them, tracked or not
    pub async fn list_backend_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        Ok(self.backend.list_worktrees().await?)
    }

    /// Drop backend records of worktrees whose directories are gone
    pub async fn prune(&self) -> Result<Vec<String>> {
        let pruned = self.backend.prune_worktrees().await?;
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned stale worktrees");
        }
        Ok(pruned)
    }

    /// Tracked workspaces belonging to one feature
    pub async fn list_for_feature(&self, feature_id: &str) -> Vec<Workspace> {
        let mut workspaces = self.list().await;
        workspaces.retain(|w| w.feature_id == feature_id);
        workspaces
    }

    /// Delete a workspace branch once its worktree is gone
    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.backend.delete_branch(branch).await?;
        debug!(branch = %branch, "Branch deleted");
        Ok(())
    }
}

fn path_component(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
