//! Progress events for batch runs and the monitor.
//!
//! The orchestrator publishes here; presentation layers subscribe. Nothing
//! in the run logic depends on an event being received.

mod bus;
mod types;

pub use bus::{EventBus, Subscription};
pub use types::*;
