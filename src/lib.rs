// Agent Worktrees Library - per-agent git worktrees, task tracking, peer
// coordination and feature integration for concurrently working agents

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod instrumented;
pub mod integration;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod workspace;

// Re-export key types for easy access
pub use broker::CoordinationBroker;
pub use config::{config, EngineConfig};
pub use engine::WorktreeEngine;
pub use error::{EngineError, ErrorKind};
pub use external::{GitCli, GitError, MergeOutcome, VersionControl, WorktreeEntry};
pub use instrumented::InstrumentedEngine;
pub use integration::{IntegrationContext, IntegrationCoordinator};
pub use ledger::TaskLedger;
pub use models::{
    AgentView, CompletionStatus, CoordinationView, FeatureCleanup, FinalStatus, IntegrationRun, IntegrationStrategy,
    MergeStatus, ResponseType, Task, TaskStatus, Workspace,
};
pub use observability::{BackendMetrics, BackendStats, OperationTimer};
pub use registry::AgentRegistry;
pub use store::{FileStore, MemoryStore, RecordStore, StoreError};
pub use telemetry::{
    create_coordination_span, generate_correlation_id, init_telemetry, NoopSink, TelemetrySink, TracingSink,
};
pub use workspace::WorkspaceManager;
