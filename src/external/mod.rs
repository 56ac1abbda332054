//! External tool abstractions
//!
//! Trait-based wrappers around the processes the engine drives, so the
//! components can be tested against scripted backends. Every git invocation
//! goes through `command::BoundedExecutor`.

pub mod command;
pub mod git;

pub use command::{BoundedExecutor, CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use git::{GitCli, GitError, MergeOutcome, VersionControl, WorktreeEntry};
