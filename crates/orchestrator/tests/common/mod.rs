#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db::SqliteStore;
use genbatch_core::{
    Catalog, MemoryStore, Scope, StateStore, StepOutput, Subject, TaskDescriptor, TaskSource,
    Variant, WorkError, WorkItem, WorkStep,
};
use orchestrator::{Orchestrator, RunOptions};
use tempfile::TempDir;

pub const OWNER: &str = "owner";

pub fn scope() -> Scope {
    Scope::new(OWNER)
}

pub fn options() -> RunOptions {
    RunOptions::default().with_cooldown(Duration::ZERO)
}

/// Scripted work step: counts calls per task key, tracks peak concurrency,
/// and fails or skips subjects on request.
#[derive(Default)]
pub struct ScriptedStep {
    delay: Duration,
    fail_once: Mutex<HashSet<String>>,
    fail_always: HashSet<String>,
    missing: HashSet<String>,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_once(self, subject_id: &str) -> Self {
        if let Ok(mut set) = self.fail_once.lock() {
            set.insert(subject_id.to_string());
        }
        self
    }

    pub fn failing_always(mut self, subject_id: &str) -> Self {
        self.fail_always.insert(subject_id.to_string());
        self
    }

    pub fn missing_prerequisite(mut self, subject_id: &str) -> Self {
        self.missing.insert(subject_id.to_string());
        self
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkStep for ScriptedStep {
    async fn execute(&self, item: &WorkItem) -> Result<StepOutput, WorkError> {
        let key = item.task.key.to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let subject = &item.task.key.subject_id;
        if self.missing.contains(subject) {
            return Err(WorkError::MissingPrerequisite("no template content".into()));
        }
        if self.fail_always.contains(subject) || self.fail_once.lock().unwrap().remove(subject) {
            return Err(WorkError::Remote("Status 502: bad gateway".into()));
        }
        Ok(StepOutput {
            content: format!("<h1>{}</h1>", key),
            model: Some("test-model".into()),
        })
    }
}

/// Subject ids `p1..=pN`, one variant `t1` with content.
pub fn subject_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("p{i}")).collect()
}

pub fn memory_store(n: usize) -> MemoryStore {
    let store = MemoryStore::default();
    for id in subject_ids(n) {
        store.add_descriptor(&scope(), TaskDescriptor::new(id, "t1").with_category("retail"));
    }
    store
}

pub async fn sqlite_store(n: usize) -> (SqliteStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}", dir.path().join("genbatch.db").display());
    let pool = db::open(&url).await.unwrap();
    let store = SqliteStore::new(pool);

    let catalog = Catalog {
        subjects: subject_ids(n)
            .into_iter()
            .map(|id| Subject {
                name: format!("Subject {id}"),
                id,
                category: Some("retail".into()),
            })
            .collect(),
        variants: vec![Variant {
            id: "t1".into(),
            name: "Landing".into(),
            content: Some("# {{name}}".into()),
        }],
    };
    store.catalog().import(OWNER, &catalog).await.unwrap();
    (store, dir)
}

pub fn orchestrator<S>(store: &S, step: Arc<ScriptedStep>) -> Orchestrator
where
    S: TaskSource + StateStore + Clone + 'static,
{
    Orchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()), step)
}
