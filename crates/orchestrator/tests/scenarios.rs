mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use genbatch_core::{MemoryStore, StateStore, Task, TaskKey, TaskStatus};
use orchestrator::{InProcessLauncher, Monitor, MonitorConfig, RunOptions};
use tokio_util::sync::CancellationToken;

async fn scenario_a<S>(store: S)
where
    S: genbatch_core::TaskSource + StateStore + Clone + 'static,
{
    let step = Arc::new(ScriptedStep::new());
    let options = options().with_max_concurrent(2).with_batch_size(5);

    let result = orchestrator(&store, step.clone())
        .run(&scope(), &options)
        .await
        .unwrap();

    assert_eq!(result.generated, 5);
    assert_eq!(result.failed, 0);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.rounds, 1);

    let stats = store.get_stats(&scope()).await.unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total, 5);
}

#[tokio::test]
async fn scenario_a_all_succeed_in_memory() {
    scenario_a(memory_store(5)).await;
}

#[tokio::test]
async fn scenario_a_all_succeed_sqlite() {
    let (store, _dir) = sqlite_store(5).await;
    scenario_a(store).await;
}

async fn scenario_b<S>(store: S)
where
    S: genbatch_core::TaskSource + StateStore + Clone + 'static,
{
    let step = Arc::new(ScriptedStep::new().failing_once("p2"));
    let orchestrator = orchestrator(&store, step.clone());
    let options = options().with_resume_from_failure(true);

    let first = orchestrator.run(&scope(), &options).await.unwrap();
    assert_eq!(first.generated, 2);
    assert_eq!(first.failed, 1);

    let second = orchestrator.run(&scope(), &options).await.unwrap();
    assert_eq!(second.attempted, 1);
    assert_eq!(second.generated, 1);
    assert_eq!(second.outcomes[0].key, TaskKey::new("p2", "t1", "en"));

    let stats = store.get_stats(&scope()).await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);

    assert_eq!(step.calls_for("p1/t1/en"), 1);
    assert_eq!(step.calls_for("p2/t1/en"), 2);
    assert_eq!(step.calls_for("p3/t1/en"), 1);
}

#[tokio::test]
async fn scenario_b_failure_resumed_in_memory() {
    let store = memory_store(3);
    scenario_b(store.clone()).await;

    let retried = store
        .find(&scope(), &TaskKey::new("p2", "t1", "en"))
        .unwrap();
    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.attempt_count, 2);
}

#[tokio::test]
async fn scenario_b_failure_resumed_sqlite() {
    let (store, _dir) = sqlite_store(3).await;
    scenario_b(store.clone()).await;

    let retried = store
        .tasks()
        .find_by_key(&TaskKey::new("p2", "t1", "en"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.attempt_count, 2);
    assert!(retried.result_meta.is_some());
}

#[tokio::test]
async fn failed_task_waits_for_resume_flag() {
    let store = memory_store(2);
    let step = Arc::new(ScriptedStep::new().failing_once("p1"));
    let orchestrator = orchestrator(&store, step.clone());

    orchestrator.run(&scope(), &options()).await.unwrap();
    let without_resume = orchestrator.run(&scope(), &options()).await.unwrap();
    assert_eq!(without_resume.attempted, 0);

    let with_resume = orchestrator
        .run(&scope(), &options().with_resume_from_failure(true))
        .await
        .unwrap();
    assert_eq!(with_resume.generated, 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_complete_scope_needs_no_run() {
    let store = MemoryStore::default();
    for n in 0..10 {
        let mut task = Task::new(&scope(), TaskKey::new(format!("p{n}"), "t1", "en"));
        task.status = TaskStatus::Completed;
        store.insert_task(task);
    }
    let step = Arc::new(ScriptedStep::new());
    let launcher = Arc::new(InProcessLauncher::new(orchestrator(&store, step.clone())));

    let summary = Monitor::new(Arc::new(store.clone()), launcher, MonitorConfig::new(scope()))
        .unwrap()
        .run(CancellationToken::new())
        .await;

    assert!(summary.reached_target);
    assert_eq!(summary.launches, 0);
    assert_eq!(step.total_calls(), 0);
    assert_eq!(summary.final_stats.unwrap().completed, 10);
}

#[tokio::test]
async fn monitor_seeds_and_drives_scope_to_completion() {
    let store = memory_store(4);
    let step = Arc::new(ScriptedStep::new());
    let launcher = Arc::new(InProcessLauncher::new(orchestrator(&store, step.clone())));
    let config = MonitorConfig::new(scope())
        .with_poll_interval(Duration::from_millis(20))
        .with_retry_delay(Duration::from_millis(20))
        .with_run_options(RunOptions::unattended().with_cooldown(Duration::ZERO));

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        Monitor::new(Arc::new(store.clone()), launcher, config)
            .unwrap()
            .run(CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(summary.reached_target);
    assert_eq!(summary.launches, 1);
    assert_eq!(summary.final_stats.unwrap().completed, 4);
    assert_eq!(step.total_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn stopped_monitor_lets_launched_run_record_its_claims() {
    let store = memory_store(4);
    let step = Arc::new(ScriptedStep::new().with_delay(Duration::from_secs(3)));
    let launcher = Arc::new(InProcessLauncher::new(orchestrator(&store, step.clone())));
    let config = MonitorConfig::new(scope())
        .with_poll_interval(Duration::from_millis(100))
        .with_run_options(
            RunOptions::unattended()
                .with_max_concurrent(4)
                .with_cooldown(Duration::ZERO),
        );
    let monitor = Monitor::new(Arc::new(store.clone()), launcher, config).unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        }
    });

    let summary = monitor.run_and_drain(cancel).await;
    assert!(summary.cancelled);
    assert_eq!(summary.launches, 1);

    // Nothing is left claimed once the monitor has returned.
    let stats = store.get_stats(&scope()).await.unwrap();
    assert_eq!(stats.in_progress, 0);
    assert_eq!(stats.completed, 4);
    assert_eq!(step.total_calls(), 4);
}
