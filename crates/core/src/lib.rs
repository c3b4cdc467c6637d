pub mod domain;
pub mod error;
pub mod memory;
pub mod traits;

pub use domain::*;
pub use error::{StoreError, WorkError};
pub use memory::MemoryStore;
pub use traits::{
    EligibilityFilter, PendingQuery, StateStore, StepOutput, StoreResult, TaskSource, WorkItem,
    WorkStep,
};
