mod catalog;
mod task;

pub use catalog::DescriptorRow;
pub use task::TaskRow;
pub(crate) use task::datetime_to_millis;
