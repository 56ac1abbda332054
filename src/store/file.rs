use async_trait::async_trait;
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{sort_runs, RecordStore, StoreError, AGENT_KIND, RUN_KIND, TASK_KIND};
use crate::models::{Agent, IntegrationRun, Task};

const LOCK_FILE: &str = ".store.lock";

/// One JSON document per record under `<root>/{agents,tasks,runs}`.
///
/// Writers serialize on an fd-lock over `<root>/.store.lock`, so several
/// processes can share a directory. Documents are written to a temporary
/// file and renamed into place; readers never see a half-written record.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in [AGENT_KIND, TASK_KIND, RUN_KIND] {
            fs::create_dir_all(root.join(kind)).await?;
        }
        debug!(root = ?root, "Opened file store");
        Ok(Self { root })
    }

    fn record_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", encode_id(id)))
    }

    async fn read<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>, StoreError> {
        read_document(&self.record_path(kind, id)).await
    }

    async fn write<T: Serialize>(&self, kind: &str, id: &str, record: &T) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(record)?;
        let target = self.record_path(kind, id);
        let lock_path = self.root.join(LOCK_FILE);

        run_locked(lock_path, move || {
            let temp = target.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
            std::fs::write(&temp, &body)?;
            std::fs::rename(&temp, &target)
        })
        .await
    }

    async fn remove(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let target = self.record_path(kind, id);
        let lock_path = self.root.join(LOCK_FILE);

        run_locked(lock_path, move || match std::fs::remove_file(&target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await
    }
}

/// Run a blocking filesystem mutation while holding the store's write lock
async fn run_locked<F>(lock_path: PathBuf, op: F) -> Result<(), StoreError>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let mut lock = RwLock::new(file);
        let _guard = lock.write().map_err(|e| StoreError::Lock {
            reason: format!("{}: {e}", lock_path.display()),
        })?;
        op()?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Lock {
        reason: format!("store writer task failed: {e}"),
    })?
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Ids are opaque; keep them filesystem-safe and collision-free
fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[async_trait]
impl RecordStore for FileStore {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        self.read(AGENT_KIND, agent_id).await
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.write(AGENT_KIND, &agent.id, agent).await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        self.remove(AGENT_KIND, agent_id).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.read(TASK_KIND, task_id).await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.write(TASK_KIND, &task.id, task).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<IntegrationRun>, StoreError> {
        self.read(RUN_KIND, run_id).await
    }

    async fn put_run(&self, run: &IntegrationRun) -> Result<(), StoreError> {
        self.write(RUN_KIND, &run.id, run).await
    }

    async fn list_runs(&self, feature_id: Option<&str>) -> Result<Vec<IntegrationRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(self.root.join(RUN_KIND)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_document::<IntegrationRun>(&path).await {
                Ok(Some(run)) => {
                    if feature_id.map_or(true, |f| run.feature_id == f) {
                        runs.push(run);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable integration run"),
            }
        }

        sort_runs(&mut runs);
        Ok(runs)
    }
}
