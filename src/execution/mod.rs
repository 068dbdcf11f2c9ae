//! Job Execution Module
//!
//! Drives the job tree under the allocation's resource and time limits.
//!
//! # Architecture
//!
//! - [`engine`]: job context, run loop and end-of-run policy
//! - [`dispatcher`]: node-budget admission control and `mpiexec` launches
//! - [`walltime`]: elapsed-time tracking and budget gating
//! - [`remote`]: named entry points bootstrapped in launched processes

pub mod dispatcher;
pub mod engine;
pub mod remote;
pub mod walltime;

pub use dispatcher::{Dispatcher, MpiWork, Ticket};
pub use engine::{execute, Engine, JobContext, Outcome, TaskMonitor};
pub use remote::{run_remote, TaskRegistry};
pub use walltime::{Budget, Walltime};
