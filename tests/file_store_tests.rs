//! FileStore persistence on a temporary directory

mod fixtures;

use agent_worktrees::config::PersistenceBackend;
use agent_worktrees::{
    CompletionStatus, EngineConfig, FileStore, IntegrationContext, IntegrationStrategy, RecordStore,
    WorktreeEngine,
};
use fixtures::{names, unique_repo, FakeBackend};
use std::path::PathBuf;
use std::sync::Arc;

async fn engine_on(dir: &std::path::Path, backend: Arc<FakeBackend>) -> (WorktreeEngine, Arc<FileStore>) {
    let mut config = EngineConfig::default();
    config.repository.path = unique_repo();
    config.repository.worktree_root = PathBuf::from("/worktrees");
    config.persistence.backend = PersistenceBackend::File;
    let store = Arc::new(FileStore::open(dir).await.unwrap());
    (WorktreeEngine::new(&config, backend, store.clone()), store)
}

#[tokio::test]
async fn records_survive_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine_on(dir.path(), FakeBackend::new()).await;

    engine.create_workspace("a1", "f1", "b-a1").await.unwrap();
    engine.activate("a1", ["rust", "sql"]).await.unwrap();
    engine.assign_task("a1", "t1", "migrations", Some(5_000)).await.unwrap();
    engine
        .report_progress("a1", "t1", 40.0, "schema", &["db/001.sql".to_string()])
        .await
        .unwrap();
    engine.complete_task("a1", "t1", CompletionStatus::Success, &[]).await.unwrap();
    let run = engine
        .integrate("f1", &names(&["a1"]), IntegrationStrategy::Sequential, &IntegrationContext::new())
        .await
        .unwrap();
    drop(engine);

    let reopened = FileStore::open(dir.path()).await.unwrap();

    let agent = reopened.get_agent("a1").await.unwrap().unwrap();
    assert_eq!(agent.capabilities.len(), 2);
    assert_eq!(agent.current_task, None);

    let task = reopened.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status.to_string(), "completed:success");
    assert!(task.files_touched.contains("db/001.sql"));

    assert_eq!(reopened.get_run(&run.id).await.unwrap(), Some(run));
    assert_eq!(reopened.list_runs(Some("f1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_missing_agent_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();

    store.delete_agent("ghost").await.unwrap();
    assert!(store.get_agent("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn unusual_ids_stay_inside_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = engine_on(dir.path(), FakeBackend::new()).await;

    engine.create_workspace("../escape", "f1", "b1").await.unwrap();
    engine.activate("../escape", Vec::<String>::new()).await.unwrap();

    assert!(store.get_agent("../escape").await.unwrap().is_some());
    assert!(!dir.path().join("escape.json").exists());
    let files: Vec<_> = std::fs::read_dir(dir.path().join("agents")).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn concurrent_writers_do_not_corrupt_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let task = agent_worktrees::models::Task::new("shared", &format!("a{i}"), "race", None);
            store.put_task(&task).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let task = store.get_task("shared").await.unwrap().unwrap();
    assert!(task.agent_id.starts_with('a'));
}
