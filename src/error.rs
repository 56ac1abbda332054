use std::fmt;
use thiserror::Error;

use crate::external::git::GitError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Every error a component returns to its caller. None of the components
/// retries on its own; retry policy belongs to the driver.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to create workspace for agent {agent}: {diagnostic}")]
    WorkspaceCreation { agent: String, diagnostic: String },

    #[error("Workspace conflict for agent {agent}: {detail}")]
    WorkspaceConflict { agent: String, detail: String },

    #[error("Failed to remove workspace for agent {agent}: {diagnostic}")]
    WorkspaceRemoval { agent: String, diagnostic: String },

    #[error("Agent {agent} has no workspace")]
    NoWorkspace { agent: String },

    #[error("Agent {agent} is not active")]
    AgentNotActive { agent: String },

    #[error("Agent {agent} is busy with task {task}")]
    AgentBusy { agent: String, task: String },

    #[error("Agent {agent} still holds open task {task}")]
    ActiveTask { agent: String, task: String },

    #[error("Task {task} is not the current task of agent {agent} (current: {current})")]
    TaskMismatch {
        agent: String,
        task: String,
        current: String,
    },

    #[error("Progress for task {task} cannot go from {previous} to {attempted}")]
    ProgressRegression {
        task: String,
        previous: f64,
        attempted: f64,
    },

    #[error("Progress {value} for task {task} is outside 0-100")]
    ProgressOutOfRange { task: String, value: f64 },

    #[error("Task {task} already exists")]
    DuplicateTask { task: String },

    #[error("Invalid completion status: {value}")]
    InvalidCompletionStatus { value: String },

    #[error("Commit for task {task} of agent {agent} failed: {diagnostic}")]
    Commit {
        agent: String,
        task: String,
        diagnostic: String,
    },

    #[error("Coordination request from {requester} has no target agents")]
    InvalidTargetSet { requester: String },

    #[error("Unknown coordination request: {request}")]
    UnknownRequest { request: String },

    #[error("Agent {agent} is not a target of coordination request {request}")]
    NotATarget { agent: String, request: String },

    #[error("Unsupported integration strategy: {strategy}")]
    UnsupportedStrategy { strategy: String },

    #[error("Invalid coordination response: {value}")]
    InvalidResponse { value: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] GitError),
}

/// Field-less mirror of `EngineError` so drivers can match on the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WorkspaceCreation,
    WorkspaceConflict,
    WorkspaceRemoval,
    NoWorkspace,
    AgentNotActive,
    AgentBusy,
    ActiveTask,
    TaskMismatch,
    ProgressRegression,
    ProgressOutOfRange,
    DuplicateTask,
    InvalidCompletionStatus,
    Commit,
    InvalidTargetSet,
    UnknownRequest,
    NotATarget,
    UnsupportedStrategy,
    InvalidResponse,
    Store,
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::WorkspaceCreation => "WorkspaceCreationError",
            ErrorKind::WorkspaceConflict => "WorkspaceConflictError",
            ErrorKind::WorkspaceRemoval => "WorkspaceRemovalError",
            ErrorKind::NoWorkspace => "NoWorkspaceError",
            ErrorKind::AgentNotActive => "AgentNotActiveError",
            ErrorKind::AgentBusy => "AgentBusyError",
            ErrorKind::ActiveTask => "ActiveTaskError",
            ErrorKind::TaskMismatch => "TaskMismatchError",
            ErrorKind::ProgressRegression => "ProgressRegressionError",
            ErrorKind::ProgressOutOfRange => "ProgressOutOfRangeError",
            ErrorKind::DuplicateTask => "DuplicateTaskError",
            ErrorKind::InvalidCompletionStatus => "InvalidCompletionStatusError",
            ErrorKind::Commit => "CommitError",
            ErrorKind::InvalidTargetSet => "InvalidTargetSetError",
            ErrorKind::UnknownRequest => "UnknownRequestError",
            ErrorKind::NotATarget => "NotATargetError",
            ErrorKind::UnsupportedStrategy => "UnsupportedStrategyError",
            ErrorKind::InvalidResponse => "InvalidResponseError",
            ErrorKind::Store => "StoreError",
            ErrorKind::Backend => "BackendError",
        };
        f.write_str(name)
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::WorkspaceCreation { .. } => ErrorKind::WorkspaceCreation,
            EngineError::WorkspaceConflict { .. } => ErrorKind::WorkspaceConflict,
            EngineError::WorkspaceRemoval { .. } => ErrorKind::WorkspaceRemoval,
            EngineError::NoWorkspace { .. } => ErrorKind::NoWorkspace,
            EngineError::AgentNotActive { .. } => ErrorKind::AgentNotActive,
            EngineError::AgentBusy { .. } => ErrorKind::AgentBusy,
            EngineError::ActiveTask { .. } => ErrorKind::ActiveTask,
            EngineError::TaskMismatch { .. } => ErrorKind::TaskMismatch,
            EngineError::ProgressRegression { .. } => ErrorKind::ProgressRegression,
            EngineError::ProgressOutOfRange { .. } => ErrorKind::ProgressOutOfRange,
            EngineError::DuplicateTask { .. } => ErrorKind::DuplicateTask,
            EngineError::InvalidCompletionStatus { .. } => ErrorKind::InvalidCompletionStatus,
            EngineError::Commit { .. } => ErrorKind::Commit,
            EngineError::InvalidTargetSet { .. } => ErrorKind::InvalidTargetSet,
            EngineError::UnknownRequest { .. } => ErrorKind::UnknownRequest,
            EngineError::NotATarget { .. } => ErrorKind::NotATarget,
            EngineError::UnsupportedStrategy { .. } => ErrorKind::UnsupportedStrategy,
            EngineError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            EngineError::Store(_) => ErrorKind::Store,
            EngineError::Backend(_) => ErrorKind::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_follow_error_taxonomy() {
        let err = EngineError::ProgressRegression {
            task: "t1".to_string(),
            previous: 50.0,
            attempted: 40.0,
        };
        assert_eq!(err.kind(), ErrorKind::ProgressRegression);
        assert_eq!(err.kind().to_string(), "ProgressRegressionError");
        assert_eq!(
            err.to_string(),
            "Progress for task t1 cannot go from 50 to 40"
        );
    }

    #[test]
    fn backend_errors_convert() {
        let err: EngineError = GitError::RepositoryNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }
}
