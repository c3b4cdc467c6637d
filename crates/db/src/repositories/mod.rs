mod catalog_repository;
mod task_repository;

pub use catalog_repository::*;
pub use task_repository::*;
