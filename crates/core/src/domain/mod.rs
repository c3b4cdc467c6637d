mod catalog;
mod run;
mod stats;
mod task;

pub use catalog::{Catalog, Subject, Variant};
pub use run::{Outcome, ResultMeta, RunResult, TaskOutcome};
pub use stats::JobStats;
pub use task::{Scope, Task, TaskDescriptor, TaskKey, TaskStatus};
