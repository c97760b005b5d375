//! Asynchronous generate/review/refine orchestration for Emblem.
//!
//! Independent agents communicate only through a topic [`Bus`]. The
//! [`Planner`] drives each job through its state machine, the [`Arbiter`]
//! fuses critic scores into a stop/refine decision and the [`MemoryAgent`]
//! remembers the best converged style per entity.
//!
//! # Main types
//!
//! - [`Bus`]: queues, observers, job-keyed reply waiters and the long-term store.
//! - [`Agent`] / [`spawn_agent`]: the worker contract and its consumption loops.
//! - [`Planner`]: per-job task with joins, timeouts and the refinement loop.
//! - [`Arbiter`]: buffered score fusion and the threshold decision.
//! - [`MemoryAgent`]: cross-job best-style cache.
//! - [`JobMonitor`]: live phase/round tracking for diagnostics and reaping.

/// Agent trait and consumption loops.
pub mod agent;
/// Score fusion and decisions.
pub mod arbiter;
/// Topic bus and long-term store.
pub mod bus;
/// Per-job state machine.
pub mod job;
/// Cross-job style memory.
pub mod memory;
/// Live job tracking.
pub mod monitor;
/// Job orchestration.
pub mod planner;
pub mod sim;

pub use agent::{spawn_agent, Agent, AgentHandle, Subscription};
pub use arbiter::{fuse, Arbiter, MAX_SUGGESTIONS};
pub use bus::{Bus, BusStats, PendingReply};
pub use job::JobState;
pub use memory::MemoryAgent;
pub use monitor::{JobCounters, JobMonitor, JobStatus};
pub use planner::Planner;
pub use sim::{scripted_workers, standard_workers, PipelineScript, ScriptedWorker};
