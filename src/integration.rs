//! Feature integration: merge each contributing agent's branch into the
//! shared target branch and account for partial failure.
//!
//! A repository has a single checked-out branch, so checkout and merge for
//! one agent run under a lock shared by every run in the process that
//! targets the same repository, whichever engine instance started it.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::external::git::VersionControl;
use crate::models::{
    AgentMergeOutcome, FinalStatus, IntegrationRun, IntegrationStrategy, MergeStatus,
};
use crate::registry::AgentRegistry;
use crate::store::RecordStore;
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::workspace::WorkspaceManager;

const DEADLINE_EXCEEDED: &str = "deadline exceeded";
const CANCELLED: &str = "cancelled";

static CHECKOUT_LOCKS: LazyLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

/// The process-wide checkout lock for a repository, keyed by its canonical
/// path (the path as given when it cannot be resolved).
pub fn checkout_lock(repository: &Path) -> Arc<Mutex<()>> {
    let key = std::fs::canonicalize(repository).unwrap_or_else(|_| repository.to_path_buf());
    let mut locks = CHECKOUT_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(key).or_default().clone()
}

/// Caller-supplied limits for one run. Agents not yet merged when the
/// deadline passes or the token is cancelled are recorded as skipped.
#[derive(Debug, Clone, Default)]
pub struct IntegrationContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl IntegrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn interrupted(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            Some(CANCELLED)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(DEADLINE_EXCEEDED)
        } else {
            None
        }
    }

    /// Resolves once the run should stop
    async fn interruption(&self) -> &'static str {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => CANCELLED,
                _ = tokio::time::sleep_until(deadline) => DEADLINE_EXCEEDED,
            },
            None => {
                self.cancel.cancelled().await;
                CANCELLED
            }
        }
    }
}

pub struct IntegrationCoordinator {
    backend: Arc<dyn VersionControl>,
    workspaces: Arc<WorkspaceManager>,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn RecordStore>,
    target_branch: String,
    checkout_lock: Arc<Mutex<()>>,
}

impl IntegrationCoordinator {
    pub fn new(
        backend: Arc<dyn VersionControl>,
        workspaces: Arc<WorkspaceManager>,
        registry: Arc<AgentRegistry>,
        store: Arc<dyn RecordStore>,
        repository: &Path,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            workspaces,
            registry,
            store,
            target_branch: target_branch.into(),
            checkout_lock: checkout_lock(repository),
        }
    }

    /// Merge each agent's branch into the target branch, in list order.
    ///
    /// A failed merge is recorded and the run moves on to the next agent.
    /// The finalized run is persisted before it is returned.
    pub async fn integrate(
        &self,
        feature_id: &str,
        contributing_agents: &[String],
        strategy: IntegrationStrategy,
        ctx: &IntegrationContext,
    ) -> Result<IntegrationRun> {
        if strategy != IntegrationStrategy::Sequential {
            return Err(EngineError::UnsupportedStrategy {
                strategy: strategy.to_string(),
            });
        }

        let correlation_id = generate_correlation_id();
        let span = create_coordination_span("feature.integration", None, Some(feature_id), Some(correlation_id.as_str()));

        async {
            let agents = dedupe(feature_id, contributing_agents);
            let run = self.run_sequential(feature_id, agents, ctx).await;

            self.store.put_run(&run).await?;

            info!(
                run_id = %run.id,
                feature_id = %feature_id,
                final_status = %run.final_status,
                succeeded = ?run.succeeded(),
                failed = ?run.failed(),
                skipped = ?run.skipped(),
                duration_ms = run.duration_ms,
                "Integration run finished"
            );
            Ok::<IntegrationRun, EngineError>(run)
        }
        .instrument(span)
        .await
    }

    async fn run_sequential(&self, feature_id: &str, agents: Vec<String>, ctx: &IntegrationContext) -> IntegrationRun {
        let started_at = Utc::now();
        let mut outcomes: Vec<AgentMergeOutcome> = Vec::with_capacity(agents.len());
        let mut first_checkout: Option<Instant> = None;
        let mut last_attempt: Option<Instant> = None;

        info!(
            feature_id = %feature_id,
            agents = ?agents,
            target_branch = %self.target_branch,
            strategy = "sequential",
            "Integration run started"
        );

        for (index, agent_id) in agents.iter().enumerate() {
            if let Some(reason) = ctx.interrupted() {
                skip_remaining(&mut outcomes, &agents[index..], reason);
                break;
            }

            let Some(workspace) = self.workspaces.get(agent_id).await else {
                warn!(agent_id = %agent_id, feature_id = %feature_id, "No workspace to integrate");
                outcomes.push(AgentMergeOutcome::failed(agent_id, None, 0, "agent has no workspace".to_string()));
                continue;
            };
            if workspace.feature_id != feature_id {
                warn!(
                    agent_id = %agent_id,
                    feature_id = %feature_id,
                    workspace_feature = %workspace.feature_id,
                    "Workspace belongs to another feature, not merging"
                );
                outcomes.push(AgentMergeOutcome::failed(
                    agent_id,
                    Some(&workspace.branch),
                    0,
                    format!("workspace belongs to feature {}", workspace.feature_id),
                ));
                continue;
            }

            let open_task = match self.registry.status(agent_id).await {
                Ok(view) => view.and_then(|v| v.current_task),
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Could not read agent state before merge");
                    None
                }
            };
            if let Some(task_id) = &open_task {
                warn!(agent_id = %agent_id, task_id = %task_id, "Integrating agent with an open task");
            }

            let _repo = tokio::select! {
                guard = self.checkout_lock.clone().lock_owned() => guard,
                reason = ctx.interruption() => {
                    skip_remaining(&mut outcomes, &agents[index..], reason);
                    break;
                }
            };
            if let Some(reason) = ctx.interrupted() {
                skip_remaining(&mut outcomes, &agents[index..], reason);
                break;
            }

            first_checkout.get_or_insert_with(Instant::now);
            let mut outcome = self.merge_agent(feature_id, agent_id, &workspace.branch).await;
            last_attempt = Some(Instant::now());

            outcome.open_task = open_task;
            outcomes.push(outcome);
        }

        let duration_ms = match (first_checkout, last_attempt) {
            (Some(first), Some(last)) => last.duration_since(first).as_millis() as u64,
            _ => 0,
        };

        let merged = outcomes.iter().filter(|o| o.status == MergeStatus::Merged).count();
        let final_status = FinalStatus::compute(merged, outcomes.len() - merged);

        IntegrationRun {
            id: Uuid::new_v4().to_string(),
            feature_id: feature_id.to_string(),
            agents,
            strategy: IntegrationStrategy::Sequential,
            target_branch: self.target_branch.clone(),
            outcomes,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            final_status,
        }
    }

    /// Checkout + merge for one agent; caller holds the checkout lock
    async fn merge_agent(&self, feature_id: &str, agent_id: &str, branch: &str) -> AgentMergeOutcome {
        if let Err(e) = self.backend.checkout(&self.target_branch).await {
            warn!(agent_id = %agent_id, target_branch = %self.target_branch, error = %e, "Checkout failed");
            return AgentMergeOutcome::failed(
                agent_id,
                Some(branch),
                0,
                format!("checkout of {} failed: {e}", self.target_branch),
            );
        }

        let message = format!("Integrate {agent_id} into {feature_id}");
        match self.backend.merge(branch, &message).await {
            Ok(merge) if merge.merged => {
                info!(agent_id = %agent_id, branch = %branch, "Branch merged");
                AgentMergeOutcome::merged(agent_id, branch)
            }
            Ok(merge) => {
                warn!(
                    agent_id = %agent_id,
                    branch = %branch,
                    merge_conflicts = merge.conflicts,
                    files = ?merge.conflicting_files,
                    "Merge failed"
                );
                self.abort_merge(agent_id).await;
                let mut outcome = AgentMergeOutcome::failed(agent_id, Some(branch), merge.conflicts, merge.diagnostic);
                outcome.conflicting_files = merge.conflicting_files;
                outcome
            }
            Err(e) => {
                warn!(agent_id = %agent_id, branch = %branch, error = %e, "Merge could not run");
                self.abort_merge(agent_id).await;
                AgentMergeOutcome::failed(agent_id, Some(branch), 0, e.to_string())
            }
        }
    }

    async fn abort_merge(&self, agent_id: &str) {
        if let Err(e) = self.backend.abort_merge().await {
            warn!(agent_id = %agent_id, error = %e, "Could not abort merge");
        }
    }

    pub async fn run(&self, run_id: &str) -> Result<Option<IntegrationRun>> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>> {
        Ok(self.store.list_runs(feature_id).await?)
    }
}

fn dedupe(feature_id: &str, agents: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(agents.len());
    for agent in agents {
        if seen.insert(agent.as_str()) {
            unique.push(agent.clone());
        } else {
            warn!(agent_id = %agent, feature_id = %feature_id, "Agent listed twice, merging once");
        }
    }
    unique
}

fn skip_remaining(outcomes: &mut Vec<AgentMergeOutcome>, remaining: &[String], reason: &str) {
    warn!(skipped = ?remaining, reason = %reason, "Integration run interrupted");
    outcomes.extend(remaining.iter().map(|agent| AgentMergeOutcome::skipped(agent, reason)));
}
