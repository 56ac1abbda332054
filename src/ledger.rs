//! Task assignment, progress and completion
//!
//! All operations take the owning agent's lock from the registry, so two
//! reports for the same agent never interleave.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{Agent, CompletionStatus, Task, TaskStatus};
use crate::registry::AgentRegistry;
use crate::store::RecordStore;
use crate::workspace::WorkspaceManager;

pub struct TaskLedger {
    store: Arc<dyn RecordStore>,
    registry: Arc<AgentRegistry>,
    workspaces: Arc<WorkspaceManager>,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn RecordStore>, registry: Arc<AgentRegistry>, workspaces: Arc<WorkspaceManager>) -> Self {
        Self {
            store,
            registry,
            workspaces,
        }
    }

    async fn active_agent(&self, agent_id: &str) -> Result<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| EngineError::AgentNotActive {
                agent: agent_id.to_string(),
            })
    }

    /// Load the agent's current task, failing if `task_id` is not it
    async fn current_task(&self, agent: &Agent, task_id: &str) -> Result<Task> {
        let mismatch = || EngineError::TaskMismatch {
            agent: agent.id.clone(),
            task: task_id.to_string(),
            current: agent.current_task.clone().unwrap_or_else(|| "none".to_string()),
        };

        if agent.current_task.as_deref() != Some(task_id) {
            return Err(mismatch());
        }
        match self.store.get_task(task_id).await? {
            Some(task) if !task.status.is_terminal() => Ok(task),
            _ => Err(mismatch()),
        }
    }

    pub async fn assign(
        &self,
        agent_id: &str,
        task_id: &str,
        description: &str,
        estimated_duration_ms: Option<u64>,
    ) -> Result<Task> {
        let _guard = self.registry.lock(agent_id).await;
        let mut agent = self.active_agent(agent_id).await?;

        if let Some(current) = &agent.current_task {
            let busy = match self.store.get_task(current).await? {
                Some(task) => !task.status.is_terminal(),
                None => true,
            };
            if busy {
                return Err(EngineError::AgentBusy {
                    agent: agent_id.to_string(),
                    task: current.clone(),
                });
            }
        }

        if self.store.get_task(task_id).await?.is_some() {
            return Err(EngineError::DuplicateTask {
                task: task_id.to_string(),
            });
        }

        // The task record is only written once the agent points at it
        let task = Task::new(task_id, agent_id, description, estimated_duration_ms);
        let previous = agent.current_task.replace(task_id.to_string());
        self.store.put_agent(&agent).await?;
        if let Err(e) = self.store.put_task(&task).await {
            agent.current_task = previous;
            if let Err(rollback) = self.store.put_agent(&agent).await {
                warn!(
                    agent_id = %agent_id,
                    task_id = %task_id,
                    error = %rollback,
                    "Could not restore agent after failed task write"
                );
            }
            return Err(e.into());
        }

        info!(
            agent_id = %agent_id,
            task_id = %task_id,
            estimated_duration_ms = ?estimated_duration_ms,
            "Task assigned"
        );
        Ok(task)
    }

    /// Record progress. Percentages never go down; a rejected report leaves
    /// the task untouched.
    pub async fn report_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        percentage: f64,
        activity: &str,
        files_touched: &[String],
    ) -> Result<Task> {
        let _guard = self.registry.lock(agent_id).await;
        let agent = self.active_agent(agent_id).await?;
        let mut task = self.current_task(&agent, task_id).await?;

        if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
            return Err(EngineError::ProgressOutOfRange {
                task: task_id.to_string(),
                value: percentage,
            });
        }
        if percentage < task.progress {
            return Err(EngineError::ProgressRegression {
                task: task_id.to_string(),
                previous: task.progress,
                attempted: percentage,
            });
        }

        task.status = TaskStatus::InProgress;
        task.progress = percentage;
        task.last_activity = Some(activity.to_string());
        task.files_touched.extend(files_touched.iter().cloned());
        task.updated_at = Utc::now();
        self.store.put_task(&task).await?;

        debug!(
            agent_id = %agent_id,
            task_id = %task_id,
            progress = percentage,
            activity = %activity,
            "Task progress"
        );
        Ok(task)
    }

    /// Finish the task. A successful task is committed first; if the commit
    /// fails the task stays as it was.
    pub async fn complete(
        &self,
        agent_id: &str,
        task_id: &str,
        status: CompletionStatus,
        files_created: &[String],
    ) -> Result<Task> {
        let _guard = self.registry.lock(agent_id).await;
        let mut agent = self.active_agent(agent_id).await?;
        let mut task = self.current_task(&agent, task_id).await?;

        task.files_created.extend(files_created.iter().cloned());

        if status == CompletionStatus::Success {
            let message = commit_message(&agent, &task);
            if let Err(e) = self.workspaces.commit(agent_id, &message).await {
                warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Task commit failed");
                return Err(EngineError::Commit {
                    agent: agent_id.to_string(),
                    task: task_id.to_string(),
                    diagnostic: e.to_string(),
                });
            }
        }

        let now = Utc::now();
        task.status = TaskStatus::Completed(status);
        task.updated_at = now;
        task.completed_at = Some(now);
        task.actual_duration_ms = Some((now - task.started_at).num_milliseconds().max(0) as u64);
        self.store.put_task(&task).await?;

        agent.current_task = None;
        self.store.put_agent(&agent).await?;

        info!(
            agent_id = %agent_id,
            task_id = %task_id,
            status = %task.status,
            actual_duration_ms = ?task.actual_duration_ms,
            estimated_duration_ms = ?task.estimated_duration_ms,
            "Task completed"
        );
        Ok(task)
    }

    pub async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.store.get_task(task_id).await?)
    }
}

fn commit_message(agent: &Agent, task: &Task) -> String {
    let feature = agent.feature_id.as_deref().unwrap_or("unknown");
    let mut message = format!(
        "Agent {} completed task {} in feature {}",
        agent.id, task.id, feature
    );

    let files: Vec<&String> = task.files_touched.union(&task.files_created).collect();
    if !files.is_empty() {
        message.push_str("\n\nFiles:\n");
        for file in files {
            message.push_str("- ");
            message.push_str(file);
            message.push('\n');
        }
    }
    message
}
