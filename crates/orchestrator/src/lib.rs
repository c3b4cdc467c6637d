pub mod config;
pub mod error;
pub mod eta;
pub mod monitor;
pub mod pool;
pub mod report;
pub mod runner;

pub use config::RunOptions;
pub use error::{OrchestratorError, Result};
pub use eta::{estimate_eta, Eta, StatsSample};
pub use monitor::{
    CompletionPolicy, InProcessLauncher, Monitor, MonitorConfig, MonitorState, MonitorSummary,
    RunLauncher,
};
pub use report::{ReportLog, RunSummary};
pub use runner::Orchestrator;
