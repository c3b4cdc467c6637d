//! Long-lived loop that watches a scope, launches runs and reports progress.
//!
//! The monitor talks to runs only through the state store. It never cancels
//! a launched run; callers that own the runtime should [`RunLauncher::drain`]
//! before exiting so claimed tasks get recorded.

use async_trait::async_trait;
use chrono::Utc;
use events::{Event, EventBus};
use genbatch_core::{JobStats, Scope, StateStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunOptions;
use crate::error::{OrchestratorError, Result};
use crate::eta::{estimate_eta, format_duration, throughput_per_hour, Eta, StatsSample};
use crate::runner::Orchestrator;

/// What counts toward the completion target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Only generated documents count; skipped tasks keep the job open.
    #[default]
    CompletedOnly,
    CompletedOrSkipped,
}

impl CompletionPolicy {
    pub fn done(&self, stats: &JobStats) -> u64 {
        match self {
            Self::CompletedOnly => stats.completed,
            Self::CompletedOrSkipped => stats.completed + stats.skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Polling,
    Launching,
    Reporting,
    Done,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scope: Scope,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    /// Defaults to the scope's current total on each poll.
    pub target_total: Option<u64>,
    pub completion_policy: CompletionPolicy,
    /// Back-off after a failed poll.
    pub retry_delay: Duration,
    /// InProgress tasks older than this are released on every poll.
    pub stale_after: Option<Duration>,
    /// Stop launching after this many runs.
    pub max_launches: Option<u32>,
    pub run_options: RunOptions,
}

impl MonitorConfig {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            poll_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(300),
            target_total: None,
            completion_policy: CompletionPolicy::default(),
            retry_delay: Duration::from_secs(60),
            stale_after: None,
            max_launches: None,
            run_options: RunOptions::unattended(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_target_total(mut self, target: u64) -> Self {
        self.target_total = Some(target);
        self
    }

    pub fn with_completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.completion_policy = policy;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn with_max_launches(mut self, max: u32) -> Self {
        self.max_launches = Some(max);
        self
    }

    pub fn with_run_options(mut self, options: RunOptions) -> Self {
        self.run_options = options;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(OrchestratorError::invalid_config("poll_interval must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(OrchestratorError::invalid_config("report_interval must be positive"));
        }
        if self.retry_delay.is_zero() {
            return Err(OrchestratorError::invalid_config("retry_delay must be positive"));
        }
        self.run_options.validate()
    }

    fn target(&self, stats: &JobStats) -> u64 {
        self.target_total.unwrap_or(stats.total)
    }
}

/// Starts orchestrator runs on the monitor's behalf.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, scope: &Scope, options: &RunOptions) -> Result<()>;

    /// Whether a run started by this launcher is still going.
    fn is_running(&self) -> bool;

    /// Waits for the last launched run to finish.
    async fn drain(&self) {}
}

/// Spawns runs on the current tokio runtime.
pub struct InProcessLauncher {
    orchestrator: Orchestrator,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessLauncher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            handle: Mutex::new(None),
        }
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RunLauncher for InProcessLauncher {
    async fn launch(&self, scope: &Scope, options: &RunOptions) -> Result<()> {
        options.validate()?;

        let orchestrator = self.orchestrator.clone();
        let scope = scope.clone();
        let options = options.clone();
        let handle = tokio::spawn(async move {
            match orchestrator.run(&scope, &options).await {
                Ok(result) => info!(
                    run_id = %result.run_id,
                    generated = result.generated,
                    failed = result.failed,
                    aborted = result.aborted.is_some(),
                    "Launched run finished"
                ),
                Err(e) => error!(error = %e, "Launched run rejected"),
            }
        });

        *self.handle() = Some(handle);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn drain(&self) {
        let handle = self.handle().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Launched run panicked");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSummary {
    /// Last stats read, if any poll ever succeeded.
    pub final_stats: Option<JobStats>,
    pub elapsed_ms: u64,
    /// Done items per hour across the whole session.
    pub per_hour: f64,
    pub launches: u32,
    pub reports: u32,
    pub reached_target: bool,
    pub cancelled: bool,
}

pub struct Monitor {
    store: Arc<dyn StateStore>,
    launcher: Arc<dyn RunLauncher>,
    config: MonitorConfig,
    events: Option<EventBus>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        launcher: Arc<dyn RunLauncher>,
        config: MonitorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            launcher,
            config,
            events: None,
        })
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// [`run`](Self::run), then waits for a launched run to finish so its
    /// claimed tasks are recorded before the caller exits.
    pub async fn run_and_drain(&self, cancel: CancellationToken) -> MonitorSummary {
        let summary = self.run(cancel).await;
        if self.launcher.is_running() {
            info!(owner = %self.config.scope.owner_id, "Waiting for launched run to finish");
        }
        self.launcher.drain().await;
        summary
    }

    /// Polls until the target is reached, no run can make progress, or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> MonitorSummary {
        let owner = &self.config.scope.owner_id;
        let policy = self.config.completion_policy;
        let started = Instant::now();

        let mut state = MonitorState::Idle;
        let mut after_report = MonitorState::Polling;
        let mut wait = false;
        let mut stats: Option<JobStats> = None;
        let mut first: Option<StatsSample> = None;
        let mut last: Option<StatsSample> = None;
        let mut reported: Option<StatsSample> = None;
        let mut launches = 0u32;
        let mut reports = 0u32;
        let mut cancelled = false;

        info!(owner = %owner, "Monitor started");

        loop {
            match state {
                MonitorState::Idle => state = MonitorState::Polling,

                MonitorState::Polling => {
                    if std::mem::take(&mut wait)
                        && !pause(self.config.poll_interval, &cancel).await
                    {
                        cancelled = true;
                        break;
                    }
                    if cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }

                    let current = match self.poll().await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(
                                error = %e,
                                retry_in = %format_duration(self.config.retry_delay),
                                "Stats poll failed, backing off"
                            );
                            self.emit(Event::Error {
                                message: e.to_string(),
                                context: Some("monitor poll".to_string()),
                            });
                            if !pause(self.config.retry_delay, &cancel).await {
                                cancelled = true;
                                break;
                            }
                            continue;
                        }
                    };

                    let sample = StatsSample::new(policy.done(&current), Instant::now());
                    first.get_or_insert(sample);
                    last = Some(sample);
                    let report_due = match reported {
                        Some(prev) => {
                            sample.at.saturating_duration_since(prev.at)
                                >= self.config.report_interval
                        }
                        None => {
                            reported = Some(sample);
                            false
                        }
                    };

                    debug!(
                        total = current.total,
                        pending = current.pending,
                        in_progress = current.in_progress,
                        completed = current.completed,
                        failed = current.failed,
                        skipped = current.skipped,
                        "Polled stats"
                    );
                    self.emit(Event::StatsPolled {
                        owner_id: owner.clone(),
                        stats: current,
                    });
                    stats = Some(current);

                    let next = self.decide(&current, launches, self.launcher.is_running());
                    state = if next != MonitorState::Done && report_due {
                        after_report = next;
                        MonitorState::Reporting
                    } else {
                        next
                    };
                    if state == MonitorState::Polling {
                        wait = true;
                    }
                }

                MonitorState::Reporting => {
                    if let (Some(current), Some(now)) = (stats, last) {
                        let prev = reported.unwrap_or(now);
                        self.report(&current, &prev, &now);
                        reported = Some(now);
                        reports += 1;
                    }
                    state = after_report;
                    if state == MonitorState::Polling {
                        wait = true;
                    }
                }

                MonitorState::Launching => {
                    match self
                        .launcher
                        .launch(&self.config.scope, &self.config.run_options)
                        .await
                    {
                        Ok(()) => {
                            launches += 1;
                            info!(owner = %owner, launches, "Launched run");
                            self.emit(Event::RunLaunched {
                                owner_id: owner.clone(),
                            });
                        }
                        Err(e) => warn!(error = %e, "Launch failed"),
                    }
                    wait = true;
                    state = MonitorState::Polling;
                }

                MonitorState::Done => break,
            }
        }

        if cancelled {
            // One last look so the closing report reflects the store.
            match self.store.get_stats(&self.config.scope).await {
                Ok(current) => {
                    stats = Some(current);
                    last = Some(StatsSample::new(policy.done(&current), Instant::now()));
                }
                Err(e) => warn!(error = %e, "Final stats poll failed"),
            }
        }

        let elapsed = started.elapsed();
        let delta = match (first, last) {
            (Some(first), Some(last)) => last.done.saturating_sub(first.done),
            _ => 0,
        };
        let reached_target = stats.is_some_and(|s| self.reached(&s));
        let summary = MonitorSummary {
            final_stats: stats,
            elapsed_ms: elapsed.as_millis() as u64,
            per_hour: throughput_per_hour(delta, elapsed),
            launches,
            reports,
            reached_target,
            cancelled,
        };

        let final_stats = stats.unwrap_or_default();
        info!(
            owner = %owner,
            completed = final_stats.completed,
            total = final_stats.total,
            elapsed = %format_duration(elapsed),
            per_hour = summary.per_hour,
            launches,
            cancelled,
            reached_target,
            "Monitor finished"
        );
        self.emit(Event::MonitorFinished {
            owner_id: owner.clone(),
            stats: final_stats,
        });

        summary
    }

    async fn poll(&self) -> StoreResult<JobStats> {
        self.store.health_check().await?;

        if let Some(stale_after) = self.config.stale_after {
            let cutoff = chrono::Duration::from_std(stale_after)
                .ok()
                .and_then(|d| Utc::now().checked_sub_signed(d));
            if let Some(cutoff) = cutoff {
                let released = self.store.release_stale(&self.config.scope, cutoff).await?;
                if released > 0 {
                    warn!(released, "Released stale in-progress tasks");
                }
            }
        }

        self.store.get_stats(&self.config.scope).await
    }

    fn reached(&self, stats: &JobStats) -> bool {
        let target = self.config.target(stats);
        target > 0 && self.config.completion_policy.done(stats) >= target
    }

    /// Next state after a successful poll. `Polling` means wait and poll again.
    pub fn decide(&self, stats: &JobStats, launches: u32, run_alive: bool) -> MonitorState {
        if self.reached(stats) {
            return MonitorState::Done;
        }

        let busy = run_alive || stats.in_progress > 0;
        if busy {
            return MonitorState::Polling;
        }

        let may_launch = self.config.max_launches.map_or(true, |max| launches < max);
        if stats.total == 0 {
            // Seed an empty scope once; a run's enumeration creates the records.
            return if launches == 0 && may_launch {
                MonitorState::Launching
            } else {
                MonitorState::Done
            };
        }

        let resumable = self.config.run_options.resume_from_failure && stats.failed > 0;
        if (stats.pending > 0 || resumable) && may_launch {
            MonitorState::Launching
        } else {
            // Nothing any run could still move forward.
            MonitorState::Done
        }
    }

    fn report(&self, current: &JobStats, prev: &StatsSample, now: &StatsSample) {
        let target = self.config.target(current);
        let eta = estimate_eta(prev, now, target);
        let eta_text = match eta {
            Eta::Reached => "reached".to_string(),
            Eta::Indeterminate => "indeterminate".to_string(),
            Eta::Estimated { remaining, .. } => format_duration(remaining),
        };

        info!(
            completed = current.completed,
            skipped = current.skipped,
            failed = current.failed,
            total = current.total,
            target,
            percent = %format!("{:.1}", current.percent_completed()),
            eta = %eta_text,
            "Progress report"
        );
        self.emit(Event::ProgressReport {
            owner_id: self.config.scope.owner_id.clone(),
            stats: *current,
            eta_secs: eta.remaining().map(|d| d.as_secs()),
        });
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}

/// Sleeps for `duration`; false when cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
