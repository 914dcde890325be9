pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod ports;
pub mod retry;
pub mod runner_config;
