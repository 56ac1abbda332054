// Core records shared by the workspace, registry, ledger, broker and
// integration components. Everything here is plain data; behaviour lives in
// the components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EngineError;

pub type AgentId = String;
pub type FeatureId = String;
pub type TaskId = String;
pub type RequestId = String;
pub type RunId = String;

/// Isolated, branch-backed working copy owned by one agent for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub agent_id: AgentId,
    pub feature_id: FeatureId,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub startup_duration_ms: u64,
}

/// An active agent. The record only exists between activation and
/// deactivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub current_task: Option<TaskId>,
    pub workspace: Option<PathBuf>,
    pub feature_id: Option<FeatureId>,
    pub activated_at: DateTime<Utc>,
}

/// Read-only snapshot merging agent and workspace state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    pub agent_id: AgentId,
    pub active: bool,
    pub capabilities: BTreeSet<String>,
    pub current_task: Option<TaskId>,
    pub activated_at: Option<DateTime<Utc>>,
    pub workspace: Option<Workspace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Partial => write!(f, "partial"),
            CompletionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for CompletionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(CompletionStatus::Success),
            "partial" => Ok(CompletionStatus::Partial),
            "failed" => Ok(CompletionStatus::Failed),
            other => Err(EngineError::InvalidCompletionStatus {
                value: other.to_string(),
            }),
        }
    }
}

/// Task lifecycle: assigned → in_progress → completed:{success|partial|failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum TaskStatus {
    Assigned,
    InProgress,
    Completed(CompletionStatus),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed(_))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed(outcome) => write!(f, "completed:{outcome}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub description: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub last_activity: Option<String>,
    pub files_touched: BTreeSet<String>,
    pub files_created: BTreeSet<String>,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: &str,
        agent_id: &str,
        description: &str,
        estimated_duration_ms: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Assigned,
            progress: 0.0,
            last_activity: None,
            files_touched: BTreeSet::new(),
            files_created: BTreeSet::new(),
            estimated_duration_ms,
            actual_duration_ms: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Accept,
    Modify,
    Reject,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Accept => write!(f, "accept"),
            ResponseType::Modify => write!(f, "modify"),
            ResponseType::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for ResponseType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(ResponseType::Accept),
            "modify" => Ok(ResponseType::Modify),
            "reject" => Ok(ResponseType::Reject),
            other => Err(EngineError::InvalidResponse {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub agent_id: AgentId,
    pub response: ResponseType,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationRequest {
    pub id: RequestId,
    pub requesting_agent: AgentId,
    pub targets: BTreeSet<AgentId>,
    pub reason: String,
    pub channel: String,
    /// Latest response per target
    pub responses: BTreeMap<AgentId, ResponseType>,
    /// Every response in arrival order, including overwritten ones
    pub history: Vec<ResponseRecord>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl CoordinationRequest {
    pub fn is_target(&self, agent_id: &str) -> bool {
        self.targets.contains(agent_id)
    }

    pub fn pending_targets(&self) -> Vec<AgentId> {
        self.targets
            .iter()
            .filter(|t| !self.responses.contains_key(*t))
            .cloned()
            .collect()
    }

    pub fn all_responded(&self) -> bool {
        self.targets.iter().all(|t| self.responses.contains_key(t))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Snapshot returned by `CoordinationBroker::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinationView {
    pub id: RequestId,
    pub requesting_agent: AgentId,
    pub targets: BTreeSet<AgentId>,
    pub reason: String,
    pub channel: String,
    pub responses: BTreeMap<AgentId, ResponseType>,
    pub history: Vec<ResponseRecord>,
    pub pending: Vec<AgentId>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Deadline passed; advisory only, the request stays open
    pub expired: bool,
}

impl CoordinationView {
    pub fn from_request(request: &CoordinationRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id.clone(),
            requesting_agent: request.requesting_agent.clone(),
            targets: request.targets.clone(),
            reason: request.reason.clone(),
            channel: request.channel.clone(),
            responses: request.responses.clone(),
            history: request.history.clone(),
            pending: request.pending_targets(),
            created_at: request.created_at,
            deadline: request.deadline,
            expired: request.is_expired_at(now),
        }
    }

    pub fn all_responded(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStrategy {
    Sequential,
    Parallel,
    Staged,
}

impl fmt::Display for IntegrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationStrategy::Sequential => write!(f, "sequential"),
            IntegrationStrategy::Parallel => write!(f, "parallel"),
            IntegrationStrategy::Staged => write!(f, "staged"),
        }
    }
}

impl FromStr for IntegrationStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(IntegrationStrategy::Sequential),
            "parallel" => Ok(IntegrationStrategy::Parallel),
            "staged" => Ok(IntegrationStrategy::Staged),
            other => Err(EngineError::UnsupportedStrategy {
                strategy: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Failed,
    /// Not attempted because the run's deadline passed or it was cancelled
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMergeOutcome {
    pub agent_id: AgentId,
    pub branch: Option<String>,
    pub status: MergeStatus,
    pub conflicts: u32,
    pub conflicting_files: Vec<String>,
    pub error: Option<String>,
    /// Task the agent still had open when its branch was merged
    pub open_task: Option<TaskId>,
}

impl AgentMergeOutcome {
    pub fn merged(agent_id: &str, branch: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            branch: Some(branch.to_string()),
            status: MergeStatus::Merged,
            conflicts: 0,
            conflicting_files: Vec::new(),
            error: None,
            open_task: None,
        }
    }

    pub fn failed(agent_id: &str, branch: Option<&str>, conflicts: u32, error: String) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            branch: branch.map(str::to_string),
            status: MergeStatus::Failed,
            conflicts,
            conflicting_files: Vec::new(),
            error: Some(error),
            open_task: None,
        }
    }

    pub fn skipped(agent_id: &str, reason: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            branch: None,
            status: MergeStatus::Skipped,
            conflicts: 0,
            conflicting_files: Vec::new(),
            error: Some(reason.to_string()),
            open_task: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Partial,
    Failed,
}

impl FinalStatus {
    /// `not_merged` counts failed and skipped agents alike.
    ///
    /// Nothing merged (including an empty run) is `Failed`; everything merged
    /// is `Success`; anything else is `Partial`.
    pub fn compute(merged: usize, not_merged: usize) -> Self {
        if merged == 0 {
            FinalStatus::Failed
        } else if not_merged == 0 {
            FinalStatus::Success
        } else {
            FinalStatus::Partial
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Success => write!(f, "success"),
            FinalStatus::Partial => write!(f, "partial"),
            FinalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One finalized integration run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRun {
    pub id: RunId,
    pub feature_id: FeatureId,
    pub agents: Vec<AgentId>,
    pub strategy: IntegrationStrategy,
    pub target_branch: String,
    pub outcomes: Vec<AgentMergeOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub final_status: FinalStatus,
}

impl IntegrationRun {
    fn agents_with(&self, status: MergeStatus) -> Vec<AgentId> {
        self.outcomes
            .iter()
            .filter(|o| o.status == status)
            .map(|o| o.agent_id.clone())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<AgentId> {
        self.agents_with(MergeStatus::Merged)
    }

    pub fn failed(&self) -> Vec<AgentId> {
        self.agents_with(MergeStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<AgentId> {
        self.agents_with(MergeStatus::Skipped)
    }

    /// Conflict count per failed agent
    pub fn conflicts(&self) -> BTreeMap<AgentId, u32> {
        self.outcomes
            .iter()
            .filter(|o| o.status == MergeStatus::Failed)
            .map(|o| (o.agent_id.clone(), o.conflicts))
            .collect()
    }

    pub fn outcome_for(&self, agent_id: &str) -> Option<&AgentMergeOutcome> {
        self.outcomes.iter().find(|o| o.agent_id == agent_id)
    }
}

/// Result of tearing down every workspace of a feature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeatureCleanup {
    pub feature_id: FeatureId,
    /// Agents whose workspace was removed
    pub removed: Vec<AgentId>,
    /// Agents left in place, with the reason
    pub retained: BTreeMap<AgentId, String>,
    /// Branches the backend refused to delete
    pub branches_kept: Vec<String>,
}
