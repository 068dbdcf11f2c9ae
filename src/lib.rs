//! Batchflow - Resumable Workflow Execution Engine
//!
//! Runs tree-structured jobs inside HPC batch allocations: serial stages,
//! concurrent groups, resource-aware distributed launches, and checkpointed
//! state so an interrupted allocation resumes where it stopped instead of
//! starting over.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: the node/task/workspace tree and its persistence
//! - [`execution`]: engine, dispatcher, walltime tracking and remote entries
//! - [`scheduler`]: batch-scheduler adapters (Slurm, local pass-through)
//! - [`config`]: the job configuration surface
//!
//! # Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use batchflow::config::JobConfig;
//! use batchflow::execution::{Engine, JobContext};
//! use batchflow::scheduler;
//! use batchflow::workflow::{Directory, Workspace, WorkspaceExt};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = JobConfig::from_yaml("job.yaml")?;
//!     let scheduler = scheduler::from_config(&config);
//!     let ctx = Rc::new(JobContext::new(
//!         config,
//!         scheduler,
//!         Directory::new("."),
//!         false,
//!     ));
//!
//!     let root = Workspace::new_root("job");
//!     root.add_fn("prepare", || Ok(()))?;
//!
//!     Engine::new(ctx).run(root).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod scheduler;
pub mod workflow;

// Re-export commonly used types
pub use config::JobConfig;
pub use error::{ExecError, GraphError};
pub use execution::{Budget, Engine, JobContext, MpiWork, Outcome, TaskRegistry};
pub use workflow::{Directory, Node, NodeRef, State, Task, Workspace, WorkspaceExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "batchflow";
