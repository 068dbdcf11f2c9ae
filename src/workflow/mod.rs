//! Workflow Object Model
//!
//! The node/task/workspace tree describing a job, plus its persistence
//! primitives.
//!
//! # Structure
//!
//! - [`node`]: the execution-unit contract and derived state machine
//! - [`task`]: leaf nodes wrapping one callable
//! - [`workspace`]: composite nodes with serial/concurrent child groups
//! - [`directory`]: scoped filesystem access
//! - [`checkpoint`]: snapshot schema and debounced persistence

pub mod checkpoint;
pub mod directory;
pub mod node;
pub mod task;
pub mod workspace;

pub use checkpoint::{restore, snapshot, Checkpoint, NodeSnapshot};
pub use directory::Directory;
pub use node::{Node, NodeRef, State};
pub use task::{Action, Progress, Task};
pub use workspace::{Workspace, WorkspaceExt};
