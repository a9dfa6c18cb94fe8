//! Block alignment scheduling and execution

/// Completion barrier between phases
pub mod barrier;
/// Shared resources for chunk tasks
pub mod context;
/// Local, queued and dry-run phase executors
pub mod executor;
/// Block partitioning, section roles and layer layout
pub mod plan;
/// Task queues for distributed execution
pub mod queue;
/// Warping, missing-data substitution and downsampling
pub mod render;
/// Phase construction and sequencing
pub mod scheduler;
/// Serializable chunk tasks
pub mod tasks;

pub use executor::{DryRunExecutor, LocalExecutor, PhaseExecutor, QueuedExecutor, Worker};
pub use plan::{BlockPlan, Layout};
pub use scheduler::{Phase, Scheduler};
pub use tasks::{ChunkTask, Task};
