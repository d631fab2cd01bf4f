// Public modules
pub mod defaults;
pub mod error;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod overlay;
pub mod prompt;
pub mod ssh;
pub mod target;
pub mod tasks;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use orchestrator::{Orchestrator, RunReport, TaskOutcome};
