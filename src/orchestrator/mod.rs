pub mod engine;
pub mod report;
pub mod state;

pub use engine::{StopHandle, WorkflowEngine, derive_run_id};
pub use report::FinalReport;
pub use state::{IndexerKind, RunOptions, RunState, RunStatus};
