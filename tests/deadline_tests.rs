//! Deadlines, cancellation and the shared checkout lock, on a paused clock

mod fixtures;

use agent_worktrees::{FinalStatus, IntegrationContext, IntegrationStrategy, MergeStatus, ResponseType};
use fixtures::{engine_on_repo, engine_with, names, ready_agents, unique_repo, FakeBackend};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn agents_after_the_deadline_are_skipped() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(100));
    let engine = engine_with(backend.clone());
    ready_agents(&engine, "f1", &["a1", "a2", "a3"]).await;

    let ctx = IntegrationContext::new().with_timeout(Duration::from_millis(150));
    let run = engine
        .integrate("f1", &names(&["a1", "a2", "a3"]), IntegrationStrategy::Sequential, &ctx)
        .await
        .unwrap();

    // a2 started before the deadline and is allowed to finish
    assert_eq!(run.succeeded(), vec!["a1", "a2"]);
    assert_eq!(run.skipped(), vec!["a3"]);
    assert!(run.failed().is_empty());
    assert_eq!(run.final_status, FinalStatus::Partial);
    assert_eq!(run.outcome_for("a3").unwrap().error.as_deref(), Some("deadline exceeded"));
    assert_eq!(run.duration_ms, 200);
    assert_eq!(backend.count("checkout"), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_run_skips_the_rest() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(100));
    let engine = engine_with(backend.clone());
    ready_agents(&engine, "f1", &["a1", "a2"]).await;

    let token = CancellationToken::new();
    let ctx = IntegrationContext::new().with_cancellation(token.clone());

    let agents = names(&["a1", "a2"]);
    let (run, _) = tokio::join!(
        engine.integrate("f1", &agents, IntegrationStrategy::Sequential, &ctx),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        }
    );
    let run = run.unwrap();

    assert_eq!(run.succeeded(), vec!["a1"]);
    assert_eq!(run.skipped(), vec!["a2"]);
    assert_eq!(run.outcome_for("a2").unwrap().status, MergeStatus::Skipped);
    assert_eq!(run.outcome_for("a2").unwrap().error.as_deref(), Some("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_never_share_the_checkout() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(30));
    let engine = engine_with(backend.clone());
    ready_agents(&engine, "f1", &["a1", "a2"]).await;
    ready_agents(&engine, "f2", &["b1", "b2"]).await;
    let ctx = IntegrationContext::new();

    let first_agents = names(&["a1", "a2"]);
    let second_agents = names(&["b1", "b2"]);
    let (first, second) = tokio::join!(
        engine.integrate("f1", &first_agents, IntegrationStrategy::Sequential, &ctx),
        engine.integrate("f2", &second_agents, IntegrationStrategy::Sequential, &ctx),
    );

    assert_eq!(first.unwrap().final_status, FinalStatus::Success);
    assert_eq!(second.unwrap().final_status, FinalStatus::Success);
    assert_eq!(backend.count("checkout"), 4);
    assert_eq!(backend.max_concurrent_checkouts(), 1);
}

#[tokio::test(start_paused = true)]
async fn engines_over_one_repository_share_the_checkout() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(30));
    let repository = unique_repo();
    let first_engine = engine_on_repo(backend.clone(), &repository);
    let second_engine = engine_on_repo(backend.clone(), &repository);
    ready_agents(&first_engine, "f1", &["a1", "a2"]).await;
    ready_agents(&second_engine, "f2", &["b1"]).await;
    let ctx = IntegrationContext::new();

    let first_agents = names(&["a1", "a2"]);
    let second_agents = names(&["b1"]);
    let (first, second) = tokio::join!(
        first_engine.integrate("f1", &first_agents, IntegrationStrategy::Sequential, &ctx),
        second_engine.integrate("f2", &second_agents, IntegrationStrategy::Sequential, &ctx),
    );

    assert_eq!(first.unwrap().final_status, FinalStatus::Success);
    assert_eq!(second.unwrap().final_status, FinalStatus::Success);
    assert_eq!(backend.count("checkout"), 3);
    assert_eq!(backend.max_concurrent_checkouts(), 1);
}

#[tokio::test(start_paused = true)]
async fn separate_repositories_do_not_wait_on_each_other() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(30));
    let first_engine = engine_with(backend.clone());
    let second_engine = engine_with(backend.clone());
    ready_agents(&first_engine, "f1", &["a1"]).await;
    ready_agents(&second_engine, "f2", &["b1"]).await;
    let ctx = IntegrationContext::new();

    let first_agents = names(&["a1"]);
    let second_agents = names(&["b1"]);
    let start = tokio::time::Instant::now();
    let (first, second) = tokio::join!(
        first_engine.integrate("f1", &first_agents, IntegrationStrategy::Sequential, &ctx),
        second_engine.integrate("f2", &second_agents, IntegrationStrategy::Sequential, &ctx),
    );

    assert_eq!(first.unwrap().final_status, FinalStatus::Success);
    assert_eq!(second.unwrap().final_status, FinalStatus::Success);
    assert!(start.elapsed() < Duration::from_millis(60));
}

#[tokio::test(start_paused = true)]
async fn deadline_while_waiting_for_checkout_skips_agent() {
    let backend = FakeBackend::new();
    backend.set_merge_delay(Duration::from_millis(500));
    let engine = engine_with(backend.clone());
    ready_agents(&engine, "f1", &["a1"]).await;
    ready_agents(&engine, "f2", &["b1"]).await;

    let slow = IntegrationContext::new();
    let hurried = IntegrationContext::new().with_timeout(Duration::from_millis(100));

    let first_agents = names(&["a1"]);
    let second_agents = names(&["b1"]);
    let (first, second) = tokio::join!(
        engine.integrate("f1", &first_agents, IntegrationStrategy::Sequential, &slow),
        engine.integrate("f2", &second_agents, IntegrationStrategy::Sequential, &hurried),
    );

    assert_eq!(first.unwrap().final_status, FinalStatus::Success);
    let second = second.unwrap();
    assert_eq!(second.skipped(), vec!["b1"]);
    assert_eq!(second.final_status, FinalStatus::Failed);
    assert_eq!(second.duration_ms, 0);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_responses_stops_at_timeout() {
    let engine = engine_with(FakeBackend::new());
    let id = engine
        .request_coordination("a1", &names(&["a2", "a3"]), "schema change", None)
        .await
        .unwrap();
    engine.respond("a2", &id, ResponseType::Modify).await.unwrap();

    let view = engine.wait_for_responses(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(view.pending, vec!["a3".to_string()]);
    assert_eq!(view.responses.len(), 1);
}

#[tokio::test]
async fn elapsed_coordination_deadline_is_reported_not_enforced() {
    let engine = engine_with(FakeBackend::new());
    let id = engine
        .request_coordination("a1", &names(&["a2"]), "r", Some(Duration::ZERO))
        .await
        .unwrap();

    let view = engine.coordination_status(&id).await.unwrap();
    assert!(view.expired);
    assert!(view.deadline.is_some());

    // Still open for responses
    engine.respond("a2", &id, ResponseType::Accept).await.unwrap();
    assert!(engine.coordination_status(&id).await.unwrap().all_responded());
}
