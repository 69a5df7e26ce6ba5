//! Execution records and the concurrency-safe store that owns them.

pub mod execution;
pub mod store;

pub use execution::{Execution, ExecutionId, ExecutionState, OutputBuffer, OutputChunk, StreamTag};
pub use store::{
    spawn_retention_sweeper, CancelOutcome, ExecutionCell, ExecutionRegistry, ExecutionSnapshot,
    RegistryCounts,
};
