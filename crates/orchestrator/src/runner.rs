use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use events::{Event, EventBus};
use genbatch_core::{
    EligibilityFilter, Outcome, PendingQuery, ResultMeta, RunResult, Scope, StateStore, StoreError,
    Task, TaskDescriptor, TaskKey, TaskOutcome, TaskSource, WorkError, WorkItem, WorkStep,
};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RunOptions;
use crate::error::Result;
use crate::pool::run_bounded;

const NO_CONTENT: &str = "variant has no content";

/// Drives rounds of claim, dispatch and record against a state store.
///
/// Exclusivity lives in the store's conditional claim, so any number of
/// orchestrators may run against the same scope.
#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn TaskSource>,
    store: Arc<dyn StateStore>,
    step: Arc<dyn WorkStep>,
    events: Option<EventBus>,
    cancel: CancellationToken,
}

/// Enumerated pairs for this run, keyed by (subject, variant).
type Descriptors = HashMap<(String, String), TaskDescriptor>;

impl Orchestrator {
    pub fn new(
        source: Arc<dyn TaskSource>,
        store: Arc<dyn StateStore>,
        step: Arc<dyn WorkStep>,
    ) -> Self {
        Self {
            source,
            store,
            step,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Stops the run between rounds once cancelled. In-flight tasks finish first.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Runs rounds until nothing eligible remains or a limit is hit.
    ///
    /// Only invalid options are returned as errors. A store failure while
    /// enumerating or listing ends the run and is reported through
    /// [`RunResult::aborted`].
    pub async fn run(&self, scope: &Scope, options: &RunOptions) -> Result<RunResult> {
        options.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, owner = %scope.owner_id);

        let result = async {
            let mut result = RunResult::new(run_id, scope.clone());
            info!(
                max_concurrent = options.max_concurrent,
                batch_size = options.batch_size,
                languages = ?options.languages,
                resume = options.resume_from_failure,
                "Run started"
            );
            self.emit(Event::RunStarted {
                run_id,
                owner_id: scope.owner_id.clone(),
                languages: options.languages.clone(),
                max_concurrent: options.max_concurrent,
            });

            if let Err(e) = self.execute(scope, options, &mut result).await {
                error!(error = %e, rounds = result.rounds, "Run aborted");
                result.abort(e.to_string());
            }
            result.finish();

            info!(
                attempted = result.attempted,
                generated = result.generated,
                skipped = result.skipped,
                failed = result.failed,
                conflicts = result.claim_conflicts,
                duration_ms = result.duration_ms,
                "Run finished"
            );
            self.emit(Event::RunFinished {
                run_id,
                attempted: result.attempted as u64,
                generated: result.generated as u64,
                skipped: result.skipped as u64,
                failed: result.failed as u64,
                duration_ms: result.duration_ms,
                aborted: result.aborted.clone(),
            });

            result
        }
        .instrument(span)
        .await;

        Ok(result)
    }

    async fn execute(
        &self,
        scope: &Scope,
        options: &RunOptions,
        result: &mut RunResult,
    ) -> std::result::Result<(), StoreError> {
        let run_id = result.run_id;
        let descriptors = self.enumerate(scope, options).await?;

        if !options.skip_completed {
            let reopened = self
                .store
                .reopen_completed(scope, &options.languages)
                .await?;
            info!(reopened, "Reopened completed tasks for regeneration");
        }

        let mut seen: HashSet<Uuid> = HashSet::new();
        // Handled tasks that may still be listed: lost claims and claim errors.
        let mut revisitable = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                result.abort("cancelled");
                break;
            }
            if options.max_rounds.is_some_and(|max| result.rounds >= max) {
                debug!(rounds = result.rounds, "Round limit reached");
                break;
            }

            let mut limit = options.batch_size;
            if let Some(max_items) = options.max_items {
                let left = max_items.saturating_sub(result.attempted);
                if left == 0 {
                    debug!(attempted = result.attempted, "Item limit reached");
                    break;
                }
                limit = limit.min(left);
            }

            let query = PendingQuery::new(scope.clone(), limit + revisitable)
                .with_languages(options.languages.clone())
                .with_failed(options.resume_from_failure)
                .excluding_run(run_id);
            let batch: Vec<Task> = self
                .store
                .list_pending(&query)
                .await?
                .into_iter()
                .filter(|task| seen.insert(task.id))
                .take(limit)
                .collect();

            if batch.is_empty() {
                debug!("No eligible tasks left");
                break;
            }

            if result.rounds > 0 && !options.cooldown.is_zero() {
                debug!(cooldown_ms = options.cooldown.as_millis() as u64, "Cooling down");
                sleep(options.cooldown).await;
            }

            result.rounds += 1;
            let round = result.rounds;
            let before = (result.generated, result.skipped, result.failed);
            info!(round, batch = batch.len(), "Round started");
            self.emit(Event::RoundStarted {
                run_id,
                round,
                batch: batch.len(),
            });

            let claimed = self.claim(batch, result, &mut revisitable).await;
            let outcomes = run_bounded(claimed, options.max_concurrent, |task| {
                let descriptor = descriptors
                    .get(&(task.key.subject_id.clone(), task.key.variant_id.clone()))
                    .cloned();
                self.process(task, descriptor, options.step_timeout, run_id)
            })
            .await;

            for outcome in outcomes {
                result.record(outcome);
            }

            let generated = result.generated - before.0;
            let skipped = result.skipped - before.1;
            let failed = result.failed - before.2;
            info!(round, generated, skipped, failed, "Round finished");
            self.emit(Event::RoundFinished {
                run_id,
                round,
                generated: generated as u64,
                skipped: skipped as u64,
                failed: failed as u64,
            });
        }

        Ok(())
    }

    /// Pages through the source and makes sure a record exists per language.
    async fn enumerate(
        &self,
        scope: &Scope,
        options: &RunOptions,
    ) -> std::result::Result<Descriptors, StoreError> {
        let mut descriptors = Descriptors::new();
        let mut created = 0;
        let mut offset = 0;

        loop {
            let filter = EligibilityFilter::default()
                .with_category_required(options.require_category)
                .page(options.page_size, offset);
            let page = self.source.list_eligible(scope, &filter).await?;
            let fetched = page.len();

            let keys: Vec<TaskKey> = page
                .iter()
                .flat_map(|d| options.languages.iter().map(move |l| d.key_for(l)))
                .collect();
            if !keys.is_empty() {
                created += self.store.ensure_tasks(scope, &keys).await?;
            }

            for descriptor in page {
                descriptors.insert(
                    (descriptor.subject_id.clone(), descriptor.variant_id.clone()),
                    descriptor,
                );
            }

            if fetched < options.page_size {
                break;
            }
            offset += fetched;
        }

        info!(pairs = descriptors.len(), created, "Enumerated eligible tasks");
        Ok(descriptors)
    }

    /// Claims each task; lost races are dropped from the round.
    async fn claim(
        &self,
        batch: Vec<Task>,
        result: &mut RunResult,
        revisitable: &mut usize,
    ) -> Vec<Task> {
        let run_id = result.run_id;
        let mut claimed = Vec::with_capacity(batch.len());

        for task in batch {
            match self.store.mark_in_progress(task.id, run_id).await {
                Ok(true) => {
                    debug!(task_id = %task.id, key = %task.key, "Claimed");
                    self.emit(Event::TaskClaimed {
                        run_id,
                        task_id: task.id,
                        key: task.key.to_string(),
                    });
                    claimed.push(task);
                }
                Ok(false) => {
                    debug!(task_id = %task.id, "Claim lost to another runner");
                    *revisitable += 1;
                    result.record_conflict();
                    self.emit(Event::ClaimConflict {
                        run_id,
                        task_id: task.id,
                    });
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Claim failed");
                    *revisitable += 1;
                    let outcome = TaskOutcome {
                        task_id: task.id,
                        key: task.key,
                        outcome: Outcome::Failed {
                            error: format!("claim failed: {}", e),
                        },
                        elapsed_ms: 0,
                    };
                    self.emit_finished(run_id, &outcome);
                    result.record(outcome);
                }
            }
        }

        claimed
    }

    /// Executes one claimed task and records its outcome. Never fails the round.
    async fn process(
        &self,
        task: Task,
        descriptor: Option<TaskDescriptor>,
        step_timeout: Duration,
        run_id: Uuid,
    ) -> TaskOutcome {
        let started = Instant::now();
        let skip_upfront = descriptor.as_ref().is_some_and(|d| !d.has_content);

        let executed = if skip_upfront {
            Err(WorkError::MissingPrerequisite(NO_CONTENT.to_string()))
        } else {
            let item = WorkItem {
                task: task.clone(),
                descriptor,
            };
            match timeout(step_timeout, self.step.execute(&item)).await {
                Ok(result) => result,
                Err(_) => Err(WorkError::Timeout(step_timeout.as_millis() as u64)),
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, recorded) = match executed {
            Ok(output) => {
                let meta = ResultMeta {
                    content_chars: output.content.chars().count(),
                    model: output.model,
                    elapsed_ms,
                };
                (Outcome::Generated, self.store.mark_completed(task.id, &meta).await)
            }
            Err(e) if e.is_skip() => {
                let reason = match e {
                    WorkError::MissingPrerequisite(reason) => reason,
                    other => other.to_string(),
                };
                let recorded = self.store.mark_skipped(task.id, &reason).await;
                (Outcome::Skipped { reason }, recorded)
            }
            Err(e) => {
                let error = e.to_string();
                warn!(task_id = %task.id, key = %task.key, error = %error, "Task failed");
                let recorded = self.store.mark_failed(task.id, &error).await;
                (Outcome::Failed { error }, recorded)
            }
        };

        // A task whose outcome could not be written stays InProgress until released.
        let outcome = match recorded {
            Ok(()) => outcome,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Recording outcome failed");
                Outcome::Failed {
                    error: format!("recording {} outcome failed: {}", outcome.as_str(), e),
                }
            }
        };

        let outcome = TaskOutcome {
            task_id: task.id,
            key: task.key,
            outcome,
            elapsed_ms,
        };
        debug!(
            task_id = %outcome.task_id,
            outcome = outcome.outcome.as_str(),
            elapsed_ms,
            "Task done"
        );
        self.emit_finished(run_id, &outcome);
        outcome
    }

    fn emit_finished(&self, run_id: Uuid, outcome: &TaskOutcome) {
        let detail = match &outcome.outcome {
            Outcome::Generated => None,
            Outcome::Skipped { reason } => Some(reason.clone()),
            Outcome::Failed { error } => Some(error.clone()),
        };
        self.emit(Event::TaskFinished {
            run_id,
            task_id: outcome.task_id,
            key: outcome.key.to_string(),
            outcome: outcome.outcome.as_str().to_string(),
            detail,
            elapsed_ms: outcome.elapsed_ms,
        });
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use genbatch_core::{MemoryStore, StepOutput, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl WorkStep for Echo {
        async fn execute(&self, item: &WorkItem) -> std::result::Result<StepOutput, WorkError> {
            Ok(StepOutput::new(format!("doc for {}", item.task.key)))
        }
    }

    /// Fails every task of one subject.
    struct FailSubject(&'static str);

    #[async_trait]
    impl WorkStep for FailSubject {
        async fn execute(&self, item: &WorkItem) -> std::result::Result<StepOutput, WorkError> {
            if item.task.key.subject_id == self.0 {
                Err(WorkError::Remote("Status 500: upstream".into()))
            } else {
                Ok(StepOutput::new("ok"))
            }
        }
    }

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkStep for Slow {
        async fn execute(&self, _item: &WorkItem) -> std::result::Result<StepOutput, WorkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_secs(60)).await;
            Ok(StepOutput::new("late"))
        }
    }

    fn seeded(subjects: usize) -> MemoryStore {
        let store = MemoryStore::default();
        for n in 0..subjects {
            store.add_descriptor(
                &Scope::new("owner"),
                TaskDescriptor::new(format!("p{n}"), "t1").with_category("retail"),
            );
        }
        store
    }

    fn orchestrator(store: &MemoryStore, step: impl WorkStep + 'static) -> Orchestrator {
        Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(step),
        )
    }

    fn fast() -> RunOptions {
        RunOptions::default().with_cooldown(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_store_access() {
        let store = seeded(2);
        store.set_offline(true);

        let err = orchestrator(&store, Echo)
            .run(&Scope::new("owner"), &fast().with_max_concurrent(0))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::OrchestratorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_generates_every_language() {
        let store = seeded(2);
        let options = fast().with_languages(["en", "de"]);

        let result = orchestrator(&store, Echo)
            .run(&Scope::new("owner"), &options)
            .await
            .unwrap();

        assert_eq!(result.generated, 4);
        assert!(result.is_success());
        assert!(store
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Completed && t.result_meta.is_some()));
    }

    #[tokio::test]
    async fn test_missing_content_is_skipped_without_calling_step() {
        let store = MemoryStore::default();
        store.add_descriptor(
            &Scope::new("owner"),
            TaskDescriptor::new("p1", "empty")
                .with_category("retail")
                .without_content(),
        );
        let step = Slow {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(step),
        );

        let result = orchestrator.run(&Scope::new("owner"), &fast()).await.unwrap();

        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(store.tasks()[0].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_failed_task_not_retried_within_run() {
        let store = seeded(2);
        let options = fast().with_resume_from_failure(true);

        let result = orchestrator(&store, FailSubject("p0"))
            .run(&Scope::new("owner"), &options)
            .await
            .unwrap();

        assert_eq!(result.generated, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.attempted, 2);
        let failed = store
            .tasks()
            .into_iter()
            .find(|t| t.status == TaskStatus::Failed)
            .unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert!(failed.last_error.unwrap().contains("upstream"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_task() {
        let store = seeded(1);
        let step = Slow {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(step),
        );
        let options = fast().with_step_timeout(Duration::from_secs(2));

        let result = orchestrator.run(&Scope::new("owner"), &options).await.unwrap();

        assert_eq!(result.failed, 1);
        let failure = result.failures().next().unwrap();
        assert!(matches!(&failure.outcome, Outcome::Failed { error } if error.contains("2000ms")));
        assert_eq!(store.tasks()[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_item_and_round_limits() {
        let store = seeded(5);

        let limited = orchestrator(&store, Echo)
            .run(&Scope::new("owner"), &fast().with_max_items(3).with_batch_size(2))
            .await
            .unwrap();
        assert_eq!(limited.attempted, 3);
        assert_eq!(limited.rounds, 2);

        let one_round = orchestrator(&store, Echo)
            .run(&Scope::new("owner"), &fast().with_batch_size(1).with_max_rounds(1))
            .await
            .unwrap();
        assert_eq!(one_round.attempted, 1);
        assert_eq!(one_round.rounds, 1);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_run() {
        let store = seeded(3);
        store.set_offline(true);

        let result = orchestrator(&store, Echo)
            .run(&Scope::new("owner"), &fast())
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.attempted, 0);
        assert!(result.aborted.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_skip_completed_false_regenerates() {
        let store = seeded(2);
        let orchestrator = orchestrator(&store, Echo);
        let scope = Scope::new("owner");

        orchestrator.run(&scope, &fast()).await.unwrap();
        let again = orchestrator
            .run(&scope, &fast().with_skip_completed(false))
            .await
            .unwrap();

        assert_eq!(again.generated, 2);
        assert!(store.tasks().iter().all(|t| t.attempt_count == 2));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_round() {
        let store = seeded(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator(&store, Echo)
            .with_cancellation(cancel)
            .run(&Scope::new("owner"), &fast())
            .await
            .unwrap();

        assert_eq!(result.attempted, 0);
        assert_eq!(result.aborted.as_deref(), Some("cancelled"));
        // Enumeration still seeded the records.
        assert_eq!(store.tasks().len(), 3);
    }

    #[tokio::test]
    async fn test_publishes_lifecycle_events() {
        let store = seeded(1);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        orchestrator(&store, Echo)
            .with_event_bus(bus)
            .run(&Scope::new("owner"), &fast())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Some(envelope) = rx.try_next() {
            kinds.push(match envelope.event {
                Event::RunStarted { .. } => "run_started",
                Event::RoundStarted { .. } => "round_started",
                Event::TaskClaimed { .. } => "claimed",
                Event::TaskFinished { .. } => "finished",
                Event::RoundFinished { .. } => "round_finished",
                Event::RunFinished { .. } => "run_finished",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "round_started",
                "claimed",
                "finished",
                "round_finished",
                "run_finished"
            ]
        );
    }
}
