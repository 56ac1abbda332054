//! Telemetry decorator around `WorktreeEngine`
//!
//! Each public operation is bracketed by `TelemetrySink::begin`/`end`.
//! Emission is fire-and-forget: a failing sink is logged and the wrapped
//! operation's result is returned untouched.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::engine::WorktreeEngine;
use crate::error::Result;
use crate::external::git::WorktreeEntry;
use crate::integration::IntegrationContext;
use crate::models::{
    AgentView, CompletionStatus, CoordinationView, FeatureCleanup, IntegrationRun, IntegrationStrategy,
    RequestId, ResponseType, Task,
};
use crate::telemetry::{SpanAttributes, TelemetrySink};

pub struct InstrumentedEngine {
    engine: Arc<WorktreeEngine>,
    sink: Arc<dyn TelemetrySink>,
}

impl InstrumentedEngine {
    pub fn new(engine: Arc<WorktreeEngine>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { engine, sink }
    }

    pub fn engine(&self) -> &WorktreeEngine {
        &self.engine
    }

    async fn traced<T, F>(&self, operation: &'static str, attributes: SpanAttributes, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let handle = match self.sink.begin(operation, attributes).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(operation = operation, error = %e, "Telemetry begin failed");
                None
            }
        };

        let result = op.await;

        if let Some(handle) = handle {
            let (success, message) = match &result {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            if let Err(e) = self.sink.end(handle, success, message).await {
                warn!(operation = operation, error = %e, "Telemetry end failed");
            }
        }

        result
    }

    pub async fn create_workspace(&self, agent_id: &str, feature_id: &str, branch: &str) -> Result<PathBuf> {
        self.traced(
            "agent.worktree.create",
            vec![
                ("agent.id", agent_id.to_string()),
                ("feature.id", feature_id.to_string()),
                ("branch.name", branch.to_string()),
            ],
            self.engine.create_workspace(agent_id, feature_id, branch),
        )
        .await
    }

    pub async fn remove_workspace(&self, agent_id: &str) -> Result<()> {
        self.traced(
            "agent.worktree.remove",
            vec![("agent.id", agent_id.to_string())],
            self.engine.remove_workspace(agent_id),
        )
        .await
    }

    pub async fn list_backend_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        self.traced("agent.worktree.list", vec![], self.engine.list_backend_worktrees())
            .await
    }

    pub async fn prune_worktrees(&self) -> Result<Vec<String>> {
        self.traced("agent.worktree.prune", vec![], self.engine.prune_worktrees())
            .await
    }

    pub async fn activate(&self, agent_id: &str, capabilities: &[String]) -> Result<()> {
        self.traced(
            "agent.worktree.activate",
            vec![
                ("agent.id", agent_id.to_string()),
                ("agent.capabilities", capabilities.join(",")),
            ],
            self.engine.activate(agent_id, capabilities.iter().cloned()),
        )
        .await
    }

    pub async fn agent_status(&self, agent_id: &str) -> Result<Option<AgentView>> {
        self.traced(
            "agent.status",
            vec![("agent.id", agent_id.to_string())],
            self.engine.agent_status(agent_id),
        )
        .await
    }

    pub async fn deactivate(&self, agent_id: &str) -> Result<()> {
        self.traced(
            "agent.worktree.deactivate",
            vec![("agent.id", agent_id.to_string())],
            self.engine.deactivate(agent_id),
        )
        .await
    }

    pub async fn cleanup(&self, agent_id: &str) -> Result<()> {
        self.traced(
            "agent.cleanup",
            vec![("agent.id", agent_id.to_string())],
            self.engine.cleanup(agent_id),
        )
        .await
    }

    pub async fn cleanup_feature(&self, feature_id: &str) -> Result<FeatureCleanup> {
        self.traced(
            "feature.worktrees.cleanup",
            vec![("feature.id", feature_id.to_string())],
            self.engine.cleanup_feature(feature_id),
        )
        .await
    }

    pub async fn assign_task(
        &self,
        agent_id: &str,
        task_id: &str,
        description: &str,
        estimated_duration_ms: Option<u64>,
    ) -> Result<Task> {
        let mut attributes = vec![
            ("agent.id", agent_id.to_string()),
            ("task.id", task_id.to_string()),
            ("task.description", description.to_string()),
        ];
        if let Some(estimate) = estimated_duration_ms {
            attributes.push(("task.estimated_duration_ms", estimate.to_string()));
        }

        self.traced(
            "agent.task.start",
            attributes,
            self.engine.assign_task(agent_id, task_id, description, estimated_duration_ms),
        )
        .await
    }

    pub async fn report_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        percentage: f64,
        activity: &str,
        files_touched: &[String],
    ) -> Result<Task> {
        self.traced(
            "agent.task.progress",
            vec![
                ("agent.id", agent_id.to_string()),
                ("task.id", task_id.to_string()),
                ("task.progress", percentage.to_string()),
                ("task.activity", activity.to_string()),
                ("task.files_touched", files_touched.len().to_string()),
            ],
            self.engine
                .report_progress(agent_id, task_id, percentage, activity, files_touched),
        )
        .await
    }

    pub async fn complete_task(
        &self,
        agent_id: &str,
        task_id: &str,
        status: CompletionStatus,
        files_created: &[String],
    ) -> Result<Task> {
        self.traced(
            "agent.task.complete",
            vec![
                ("agent.id", agent_id.to_string()),
                ("task.id", task_id.to_string()),
                ("task.status", status.to_string()),
                ("task.files_created", files_created.len().to_string()),
            ],
            self.engine.complete_task(agent_id, task_id, status, files_created),
        )
        .await
    }

    pub async fn request_coordination(
        &self,
        requesting_agent: &str,
        target_agents: &[String],
        reason: &str,
        deadline: Option<Duration>,
    ) -> Result<RequestId> {
        self.traced(
            "agent.coordination.request",
            vec![
                ("agent.id", requesting_agent.to_string()),
                ("coordination.targets", target_agents.join(",")),
                ("coordination.reason", reason.to_string()),
            ],
            self.engine
                .request_coordination(requesting_agent, target_agents, reason, deadline),
        )
        .await
    }

    pub async fn respond(&self, responding_agent: &str, request_id: &str, response: ResponseType) -> Result<()> {
        self.traced(
            "agent.coordination.response",
            vec![
                ("agent.id", responding_agent.to_string()),
                ("coordination.request_id", request_id.to_string()),
                ("coordination.response", response.to_string()),
            ],
            self.engine.respond(responding_agent, request_id, response),
        )
        .await
    }

    pub async fn coordination_status(&self, request_id: &str) -> Option<CoordinationView> {
        self.traced(
            "agent.coordination.status",
            vec![("coordination.request_id", request_id.to_string())],
            async { Ok(self.engine.coordination_status(request_id).await) },
        )
        .await
        .ok()
        .flatten()
    }

    pub async fn wait_for_responses(&self, request_id: &str, timeout: Duration) -> Result<CoordinationView> {
        self.traced(
            "agent.coordination.wait",
            vec![
                ("coordination.request_id", request_id.to_string()),
                ("coordination.timeout_ms", timeout.as_millis().to_string()),
            ],
            self.engine.wait_for_responses(request_id, timeout),
        )
        .await
    }

    pub async fn integrate(
        &self,
        feature_id: &str,
        contributing_agents: &[String],
        strategy: IntegrationStrategy,
        ctx: &IntegrationContext,
    ) -> Result<IntegrationRun> {
        self.traced(
            "feature.integration.start",
            vec![
                ("feature.id", feature_id.to_string()),
                ("integration.agents", contributing_agents.join(",")),
                ("integration.strategy", strategy.to_string()),
            ],
            self.engine.integrate(feature_id, contributing_agents, strategy, ctx),
        )
        .await
    }

    pub async fn integration_run(&self, run_id: &str) -> Result<Option<IntegrationRun>> {
        self.traced(
            "feature.integration.lookup",
            vec![("integration.run_id", run_id.to_string())],
            self.engine.integration_run(run_id),
        )
        .await
    }
}
