//! Shared test doubles: a scripted version-control backend and a telemetry
//! sink that records every span.

#![allow(dead_code)]

use agent_worktrees::external::git::{GitError, MergeOutcome, VersionControl, WorktreeEntry};
use agent_worktrees::telemetry::{SpanAttributes, SpanHandle, TelemetryError, TelemetrySink};
use agent_worktrees::models::Agent;
use agent_worktrees::{EngineConfig, IntegrationRun, MemoryStore, RecordStore, StoreError, Task, WorktreeEngine};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory backend. Merges are clean unless scripted per branch.
#[derive(Default)]
pub struct FakeBackend {
    commands: Mutex<Vec<String>>,
    worktrees: Mutex<HashMap<PathBuf, String>>,
    merge_results: Mutex<HashMap<String, MergeOutcome>>,
    failing_branches: Mutex<HashSet<String>>,
    fail_commits: AtomicBool,
    merge_delay: Mutex<Option<Duration>>,
    commits: AtomicUsize,
    in_checkout: AtomicUsize,
    max_in_checkout: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_conflicts(&self, branch: &str, files: &[&str]) {
        self.merge_results.lock().unwrap().insert(
            branch.to_string(),
            MergeOutcome::conflicted(files.iter().map(|f| f.to_string()).collect()),
        );
    }

    pub fn fail_worktree_creation(&self, branch: &str) {
        self.failing_branches.lock().unwrap().insert(branch.to_string());
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_merge_delay(&self, delay: Duration) {
        *self.merge_delay.lock().unwrap() = Some(delay);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Highest number of checkout+merge sections seen at once
    pub fn max_concurrent_checkouts(&self) -> usize {
        self.max_in_checkout.load(Ordering::SeqCst)
    }

    fn record(&self, command: String) {
        self.commands.lock().unwrap().push(command);
    }
}

#[async_trait]
impl VersionControl for FakeBackend {
    async fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        self.record(format!("worktree add -b {branch} {} {base}", path.display()));
        if self.failing_branches.lock().unwrap().contains(branch) {
            return Err(GitError::BranchExists {
                branch: branch.to_string(),
            });
        }
        self.worktrees
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, _force: bool) -> Result<(), GitError> {
        self.record(format!("worktree remove {}", path.display()));
        match self.worktrees.lock().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(GitError::WorktreeNotFound {
                path: path.display().to_string(),
            }),
        }
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, GitError> {
        self.record("worktree list".to_string());
        let mut entries: Vec<WorktreeEntry> = self
            .worktrees
            .lock()
            .unwrap()
            .iter()
            .map(|(path, branch)| WorktreeEntry {
                path: path.clone(),
                branch: Some(branch.clone()),
                ..Default::default()
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn prune_worktrees(&self) -> Result<Vec<String>, GitError> {
        self.record("worktree prune".to_string());
        Ok(Vec::new())
    }

    async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.record(format!("checkout {branch}"));
        let now = self.in_checkout.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_checkout.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome, GitError> {
        self.record(format!("merge {branch} -m {message}"));
        let delay = *self.merge_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_checkout.fetch_sub(1, Ordering::SeqCst);
        Ok(self
            .merge_results
            .lock()
            .unwrap()
            .get(branch)
            .cloned()
            .unwrap_or_else(MergeOutcome::clean))
    }

    async fn abort_merge(&self) -> Result<(), GitError> {
        self.record("merge --abort".to_string());
        Ok(())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GitError> {
        self.record(format!("commit {} -m {message}", worktree.display()));
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(GitError::GitCommandFailed {
                message: "fatal: unable to write new index file".to_string(),
            });
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.record(format!("branch -D {branch}"));
        Ok(())
    }
}

/// Repository path no other test uses, so checkout locks stay separate
pub fn unique_repo() -> PathBuf {
    PathBuf::from(format!("/repo-{}", uuid::Uuid::new_v4()))
}

/// Engine over a fake backend and an in-memory store
pub fn engine_with(backend: Arc<FakeBackend>) -> WorktreeEngine {
    engine_on_repo(backend, &unique_repo())
}

pub fn engine_on_repo(backend: Arc<FakeBackend>, repository: &Path) -> WorktreeEngine {
    engine_with_store(backend, Arc::new(MemoryStore::new()), repository)
}

pub fn engine_with_store(backend: Arc<FakeBackend>, store: Arc<dyn RecordStore>, repository: &Path) -> WorktreeEngine {
    let mut config = EngineConfig::default();
    config.repository.path = repository.to_path_buf();
    config.repository.worktree_root = PathBuf::from("/worktrees");
    WorktreeEngine::new(&config, backend, store)
}

/// Memory store that yields to the scheduler around every access, so
/// unsynchronised read-modify-write sequences would interleave.
#[derive(Default)]
pub struct YieldingStore {
    inner: MemoryStore,
}

impl YieldingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

async fn pause() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl RecordStore for YieldingStore {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        pause().await;
        self.inner.get_agent(agent_id).await
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        pause().await;
        self.inner.put_agent(agent).await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        pause().await;
        self.inner.delete_agent(agent_id).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        pause().await;
        self.inner.get_task(task_id).await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        pause().await;
        self.inner.put_task(task).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<IntegrationRun>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn put_run(&self, run: &IntegrationRun) -> Result<(), StoreError> {
        self.inner.put_run(run).await
    }

    async fn list_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>, StoreError> {
        self.inner.list_runs(feature_id).await
    }
}

/// Workspace + activation for each agent, branch `b-<agent>`
pub async fn ready_agents(engine: &WorktreeEngine, feature: &str, agents: &[&str]) {
    for agent in agents {
        engine
            .create_workspace(agent, feature, &format!("b-{agent}"))
            .await
            .unwrap();
        engine.activate(agent, ["rust"]).await.unwrap();
    }
}

pub fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Begin {
        handle: SpanHandle,
        operation: String,
        attributes: Vec<(String, String)>,
    },
    End {
        handle: SpanHandle,
        success: bool,
        error: Option<String>,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    next: AtomicU64,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Begin { operation, .. } => Some(operation),
                SinkEvent::End { .. } => None,
            })
            .collect()
    }

    /// (operation, success) for every closed span
    pub fn outcomes(&self) -> Vec<(String, bool)> {
        let events = self.events();
        let mut names = HashMap::new();
        let mut outcomes = Vec::new();
        for event in events {
            match event {
                SinkEvent::Begin { handle, operation, .. } => {
                    names.insert(handle, operation);
                }
                SinkEvent::End { handle, success, .. } => {
                    outcomes.push((names.get(&handle).cloned().unwrap_or_default(), success));
                }
            }
        }
        outcomes
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn begin(&self, operation: &str, attributes: SpanAttributes) -> Result<SpanHandle, TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Unavailable {
                reason: "collector offline".to_string(),
            });
        }
        let handle = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(SinkEvent::Begin {
            handle,
            operation: operation.to_string(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        Ok(handle)
    }

    async fn end(&self, handle: SpanHandle, success: bool, error_message: Option<String>) -> Result<(), TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Unavailable {
                reason: "collector offline".to_string(),
            });
        }
        self.events.lock().unwrap().push(SinkEvent::End {
            handle,
            success,
            error: error_message,
        });
        Ok(())
    }
}
