//! `WorktreeEngine` wires the five components over one backend and one store.
//!
//! The engine itself emits no telemetry spans; wrap it in
//! `InstrumentedEngine` for that.

use anyhow::Context;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broker::CoordinationBroker;
use crate::config::{EngineConfig, PersistenceBackend};
use crate::error::Result;
use crate::external::command::{BoundedExecutor, ProcessCommandExecutor};
use crate::external::git::{GitCli, VersionControl, WorktreeEntry};
use crate::integration::{IntegrationContext, IntegrationCoordinator};
use crate::ledger::TaskLedger;
use crate::models::{
    AgentView, CompletionStatus, CoordinationView, FeatureCleanup, IntegrationRun, IntegrationStrategy,
    RequestId, ResponseType, Task, Workspace,
};
use crate::observability::{BackendMetrics, BackendStats};
use crate::registry::AgentRegistry;
use crate::store::{FileStore, MemoryStore, RecordStore};
use crate::workspace::WorkspaceManager;

pub struct WorktreeEngine {
    workspaces: Arc<WorkspaceManager>,
    registry: Arc<AgentRegistry>,
    ledger: TaskLedger,
    broker: CoordinationBroker,
    integrator: IntegrationCoordinator,
    metrics: Arc<BackendMetrics>,
}

impl WorktreeEngine {
    pub fn new(config: &EngineConfig, backend: Arc<dyn VersionControl>, store: Arc<dyn RecordStore>) -> Self {
        Self::with_metrics(config, backend, store, Arc::new(BackendMetrics::new()))
    }

    fn with_metrics(
        config: &EngineConfig,
        backend: Arc<dyn VersionControl>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<BackendMetrics>,
    ) -> Self {
        let repo = &config.repository;
        let workspaces = Arc::new(
            WorkspaceManager::new(backend.clone(), repo.resolved_worktree_root(), repo.base_branch.clone())
                .with_force_remove(repo.force_remove),
        );
        let registry = Arc::new(AgentRegistry::new(store.clone(), workspaces.clone()));
        let ledger = TaskLedger::new(store.clone(), registry.clone(), workspaces.clone());
        let integrator = IntegrationCoordinator::new(
            backend,
            workspaces.clone(),
            registry.clone(),
            store,
            &repo.path,
            repo.target_branch.clone(),
        );

        Self {
            workspaces,
            registry,
            ledger,
            broker: CoordinationBroker::new(),
            integrator,
            metrics,
        }
    }

    /// Build the git CLI backend and the configured store
    pub async fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(BackendMetrics::new());
        let executor = BoundedExecutor::new(
            Arc::new(ProcessCommandExecutor),
            config.backend.max_concurrent_commands,
            config.backend.command_timeout(),
            metrics.clone(),
        );

        let mut git = GitCli::new(Arc::new(executor), config.repository.path.clone())
            .with_program(config.backend.program.clone());
        if let Some(identity) = &config.repository.identity {
            git = git.with_identity(identity.name.clone(), identity.email.clone());
        }

        let store: Arc<dyn RecordStore> = match config.persistence.backend {
            PersistenceBackend::Memory => Arc::new(MemoryStore::new()),
            PersistenceBackend::File => Arc::new(
                FileStore::open(config.persistence.directory.clone())
                    .await
                    .context("Failed to open file store")?,
            ),
            #[cfg(feature = "database")]
            PersistenceBackend::Sqlite => Arc::new(
                crate::store::SqliteStore::open(&config.persistence.database_url)
                    .await
                    .context("Failed to open SQLite store")?,
            ),
            #[cfg(not(feature = "database"))]
            PersistenceBackend::Sqlite => {
                anyhow::bail!("SQLite persistence requires the `database` feature")
            }
        };

        info!(
            repository = %config.repository.path.display(),
            worktree_root = %config.repository.resolved_worktree_root().display(),
            persistence = ?config.persistence.backend,
            max_concurrent_commands = config.backend.max_concurrent_commands,
            "Worktree engine ready"
        );
        Ok(Self::with_metrics(config, Arc::new(git), store, metrics))
    }

    pub async fn create_workspace(&self, agent_id: &str, feature_id: &str, branch: &str) -> Result<PathBuf> {
        let _guard = self.registry.lock(agent_id).await;
        self.workspaces.create(agent_id, feature_id, branch).await
    }

    pub async fn remove_workspace(&self, agent_id: &str) -> Result<()> {
        let _guard = self.registry.lock(agent_id).await;
        self.workspaces.remove(agent_id).await
    }

    pub async fn workspace(&self, agent_id: &str) -> Option<Workspace> {
        self.workspaces.get(agent_id).await
    }

    pub async fn workspaces(&self) -> Vec<Workspace> {
        self.workspaces.list().await
    }

    pub async fn list_backend_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        self.workspaces.list_backend_worktrees().await
    }

    pub async fn prune_worktrees(&self) -> Result<Vec<String>> {
        self.workspaces.prune().await
    }

    pub async fn activate<I, S>(&self, agent_id: &str, capabilities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        self.registry.activate(agent_id, capabilities).await
    }

    pub async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentView>> {
        self.registry.status(agent_id).await
    }

    pub async fn deactivate(&self, agent_id: &str) -> Result<()> {
        self.registry.deactivate(agent_id).await
    }

    /// Deactivate the agent, then remove its workspace
    pub async fn cleanup(&self, agent_id: &str) -> Result<()> {
        let _guard = self.registry.lock(agent_id).await;
        self.registry.deactivate_locked(agent_id).await?;
        self.workspaces.remove(agent_id).await?;
        info!(agent_id = %agent_id, "Agent cleaned up");
        Ok(())
    }

    /// Tear down every workspace of a feature and delete its branches.
    ///
    /// Agents are handled one at a time under their own lock. An agent that
    /// still holds an open task, or whose worktree the backend refuses to
    /// remove, is left in place and reported in `retained`.
    pub async fn cleanup_feature(&self, feature_id: &str) -> Result<FeatureCleanup> {
        let mut report = FeatureCleanup {
            feature_id: feature_id.to_string(),
            ..FeatureCleanup::default()
        };

        for candidate in self.workspaces.list_for_feature(feature_id).await {
            let agent_id = candidate.agent_id.as_str();
            let _guard = self.registry.lock(agent_id).await;

            // Re-read under the lock; the workspace may have changed hands
            let Some(workspace) = self.workspaces.get(agent_id).await else {
                continue;
            };
            if workspace.feature_id != feature_id {
                continue;
            }

            let teardown = async {
                self.registry.deactivate_locked(agent_id).await?;
                self.workspaces.remove(agent_id).await
            };
            if let Err(e) = teardown.await {
                warn!(agent_id = %agent_id, feature_id = %feature_id, error = %e, "Workspace kept during feature cleanup");
                report.retained.insert(agent_id.to_string(), e.to_string());
                continue;
            }

            if let Err(e) = self.workspaces.delete_branch(&workspace.branch).await {
                warn!(agent_id = %agent_id, branch = %workspace.branch, error = %e, "Branch not deleted");
                report.branches_kept.push(workspace.branch.clone());
            }
            report.removed.push(agent_id.to_string());
        }

        info!(
            feature_id = %feature_id,
            removed = ?report.removed,
            retained = report.retained.len(),
            "Feature workspaces cleaned up"
        );
        Ok(report)
    }

    pub async fn assign_task(
        &self,
        agent_id: &str,
        task_id: &str,
        description: &str,
        estimated_duration_ms: Option<u64>,
    ) -> Result<Task> {
        self.ledger.assign(agent_id, task_id, description, estimated_duration_ms).await
    }

    pub async fn report_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        percentage: f64,
        activity: &str,
        files_touched: &[String],
    ) -> Result<Task> {
        self.ledger
            .report_progress(agent_id, task_id, percentage, activity, files_touched)
            .await
    }

    pub async fn complete_task(
        &self,
        agent_id: &str,
        task_id: &str,
        status: CompletionStatus,
        files_created: &[String],
    ) -> Result<Task> {
        self.ledger.complete(agent_id, task_id, status, files_created).await
    }

    pub async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        self.ledger.task(task_id).await
    }

    pub async fn request_coordination(
        &self,
        requesting_agent: &str,
        target_agents: &[String],
        reason: &str,
        deadline: Option<Duration>,
    ) -> Result<RequestId> {
        self.broker
            .request(requesting_agent, target_agents, reason, deadline)
            .await
    }

    pub async fn respond(&self, responding_agent: &str, request_id: &str, response: ResponseType) -> Result<()> {
        self.broker.respond(responding_agent, request_id, response).await
    }

    pub async fn coordination_status(&self, request_id: &str) -> Option<CoordinationView> {
        self.broker.status(request_id).await
    }

    pub async fn wait_for_responses(&self, request_id: &str, timeout: Duration) -> Result<CoordinationView> {
        self.broker.wait_for_responses(request_id, timeout).await
    }

    pub async fn integrate(
        &self,
        feature_id: &str,
        contributing_agents: &[String],
        strategy: IntegrationStrategy,
        ctx: &IntegrationContext,
    ) -> Result<IntegrationRun> {
        self.integrator
            .integrate(feature_id, contributing_agents, strategy, ctx)
            .await
    }

    pub async fn integration_run(&self, run_id: &str) -> Result<Option<IntegrationRun>> {
        self.integrator.run(run_id).await
    }

    pub async fn integration_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>> {
        self.integrator.runs(feature_id).await
    }

    /// Counters for commands run through the backend worker pool
    pub fn backend_metrics(&self) -> BackendStats {
        self.metrics.get_stats()
    }
}
