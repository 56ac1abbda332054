//! Git command abstractions
//!
//! `VersionControl` is the backend interface the engine drives: worktree
//! creation and removal, branch checkout, merge and commit. `GitCli` is the
//! implementation over the git command line, routed through a
//! `CommandExecutor` so tests can script the backend.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use super::command::{CommandError, CommandExecutor, CommandOutput};

pub type BranchName = String;

/// Token counted in merge output to tally conflicts
pub const CONFLICT_MARKER: &str = "CONFLICT";

/// Bumped whenever output parsing (conflict marker, porcelain format) changes
pub const BACKEND_INTERFACE_VERSION: u32 = 1;

static CONFLICT_FILE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)Merge conflict in (.+?)\s*$").ok());

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Repository not found or not a git repository")]
    RepositoryNotFound,
    #[error("Branch not found: {branch}")]
    BranchNotFound { branch: BranchName },
    #[error("Branch already exists: {branch}")]
    BranchExists { branch: BranchName },
    #[error("Not a working tree: {path}")]
    WorktreeNotFound { path: String },
    #[error("Command execution error: {source}")]
    CommandError {
        #[from]
        source: CommandError,
    },
    #[error("Git command failed: {message}")]
    GitCommandFailed { message: String },
}

/// One entry of `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: Option<BranchName>,
    pub bare: bool,
    pub locked: bool,
}

/// Result of merging a branch into the checked-out branch.
///
/// A non-zero merge exit is not an `Err`: it is reported here with the
/// conflict tally so the caller can record it and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: bool,
    pub conflicts: u32,
    pub conflicting_files: Vec<String>,
    pub diagnostic: String,
}

impl MergeOutcome {
    pub fn clean() -> Self {
        Self {
            merged: true,
            conflicts: 0,
            conflicting_files: Vec::new(),
            diagnostic: String::new(),
        }
    }

    pub fn conflicted(conflicting_files: Vec<String>) -> Self {
        Self {
            merged: false,
            conflicts: conflicting_files.len() as u32,
            diagnostic: conflicting_files
                .iter()
                .map(|f| format!("CONFLICT (content): Merge conflict in {f}"))
                .collect::<Vec<_>>()
                .join("\n"),
            conflicting_files,
        }
    }

    pub fn from_output(output: &CommandOutput) -> Self {
        let diagnostic = output.combined();
        if output.success() {
            return Self {
                diagnostic,
                ..Self::clean()
            };
        }

        Self {
            merged: false,
            conflicts: count_conflicts(&diagnostic),
            conflicting_files: conflicting_files(&diagnostic),
            diagnostic,
        }
    }
}

/// Count conflict markers in backend output
pub fn count_conflicts(output: &str) -> u32 {
    output.matches(CONFLICT_MARKER).count() as u32
}

/// Extract the paths git reports as conflicting
pub fn conflicting_files(output: &str) -> Vec<String> {
    match CONFLICT_FILE_PATTERN.as_ref() {
        Some(pattern) => pattern
            .captures_iter(output)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        None => Vec::new(),
    }
}

/// Parse `git worktree list --porcelain`
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                ..Default::default()
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    entries
}

/// Trait for the version-control backend
///
/// Every method is one (or two) backend process invocations and is a
/// suspension point for the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create a worktree at `path` on a new branch cut from `base`
    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError>;

    /// Remove the worktree at `path`
    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError>;

    /// List worktrees known to the repository
    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError>;

    /// Prune administrative entries of worktrees whose directory is gone
    async fn prune_worktrees(&self) -> Result<Vec<String>, GitError>;

    /// Checkout a branch in the shared repository
    async fn checkout(&self, branch: &str) -> Result<(), GitError>;

    /// Merge `branch` into the currently checked-out branch
    async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome, GitError>;

    /// Abort an in-progress merge in the shared repository
    async fn abort_merge(&self) -> Result<(), GitError>;

    /// Stage everything in `worktree` and commit it
    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GitError>;

    /// Force-delete a local branch
    async fn delete_branch(&self, branch: &str) -> Result<(), GitError>;
}

/// Real Git implementation over the git CLI
pub struct GitCli {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    repo_path: PathBuf,
    identity: Option<(String, String)>,
}

impl GitCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            program: "git".to_string(),
            repo_path: repo_path.into(),
            identity: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Commit identity passed as `-c user.name/-c user.email` on every command
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some((name.into(), email.into()));
        self
    }

    fn build_args(&self, dir: &Path, args: &[&str]) -> Vec<String> {
        let mut full = vec!["-C".to_string(), dir.to_string_lossy().to_string()];
        if let Some((name, email)) = &self.identity {
            full.push("-c".to_string());
            full.push(format!("user.name={name}"));
            full.push("-c".to_string());
            full.push(format!("user.email={email}"));
        }
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput, GitError> {
        let full = self.build_args(dir, args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        Ok(self.executor.execute(&self.program, &refs).await?)
    }

    async fn execute_git_command(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(dir, args).await?;

        if !output.success() {
            return Err(self.classify_git_error(&output, args));
        }

        Ok(output.stdout.trim().to_string())
    }

    fn classify_git_error(&self, output: &CommandOutput, args: &[&str]) -> GitError {
        let stderr = output.stderr.as_str();
        let branch_arg = || {
            args.iter()
                .position(|a| *a == "-b")
                .and_then(|i| args.get(i + 1))
                .or_else(|| args.last())
                .unwrap_or(&"unknown")
                .to_string()
        };

        if stderr.contains("not a git repository") {
            GitError::RepositoryNotFound
        } else if stderr.contains("already exists") && args.contains(&"-b") {
            GitError::BranchExists { branch: branch_arg() }
        } else if args.contains(&"checkout")
            && (stderr.contains("did not match any") || stderr.contains("invalid reference"))
        {
            GitError::BranchNotFound { branch: branch_arg() }
        } else if args.first() == Some(&"branch") && stderr.contains("not found") {
            GitError::BranchNotFound { branch: branch_arg() }
        } else if stderr.contains("is not a working tree") {
            GitError::WorktreeNotFound {
                path: args.last().unwrap_or(&"unknown").to_string(),
            }
        } else {
            let message = output.combined();
            GitError::GitCommandFailed {
                message: if message.is_empty() {
                    format!("exit status {}", output.status_code)
                } else {
                    message
                },
            }
        }
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        self.execute_git_command(&self.repo_path, &["worktree", "add", "-b", branch, &*path, base])
            .await?;
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&*path);
        self.execute_git_command(&self.repo_path, &args).await?;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        let output = self
            .execute_git_command(&self.repo_path, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    async fn prune_worktrees(&self) -> Result<Vec<String>, GitError> {
        let output = self.run(&self.repo_path, &["worktree", "prune", "-v"]).await?;
        if !output.success() {
            return Err(self.classify_git_error(&output, &["worktree", "prune"]));
        }
        // `prune -v` reports on stderr
        Ok(output
            .combined()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.execute_git_command(&self.repo_path, &["checkout", branch]).await?;
        Ok(())
    }

    async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome, GitError> {
        let output = self
            .run(&self.repo_path, &["merge", "--no-ff", "-m", message, branch])
            .await?;
        Ok(MergeOutcome::from_output(&output))
    }

    async fn abort_merge(&self) -> Result<(), GitError> {
        self.execute_git_command(&self.repo_path, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GitError> {
        self.execute_git_command(worktree, &["add", "-A"]).await?;
        self.execute_git_command(worktree, &["commit", "--allow-empty", "-m", message])
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.execute_git_command(&self.repo_path, &["branch", "-D", branch]).await?;
        Ok(())
    }
}
