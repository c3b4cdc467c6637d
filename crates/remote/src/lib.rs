pub mod error;
pub mod generation;
pub mod records;
pub mod types;

pub use error::{RemoteError, Result};
pub use generation::GenerationClient;
pub use records::RecordsClient;
