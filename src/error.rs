//! Error Types
//!
//! Distinguishes the three kinds of conditions a work unit can end with:
//!
//! - A hard failure: a genuine defect, reported to the operator.
//! - A resubmit request: the attempt did not succeed but the job is not
//!   broken; retry on the next run.
//! - Insufficient walltime: the remaining allocation cannot cover a
//!   requested budget; stop cleanly, checkpoint, and possibly requeue.
//!
//! The two non-fatal kinds leave a task `Paused` instead of `Failed` and are
//! excluded from the hard-error aggregate that decides whether a stopped job
//! may be requeued.

use thiserror::Error;

/// Execution error captured by a task.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Hard failure. Halts the enclosing serial workspace and is surfaced
    /// to the operator as a non-zero process exit.
    #[error("{0}")]
    Failure(String),

    /// The attempt should be retried on the next run of the job.
    #[error("resubmit requested: {0}")]
    Resubmit(String),

    /// Remaining walltime cannot cover a requested budget.
    #[error("insufficient walltime: {0}")]
    InsufficientTime(String),

    /// Filesystem or subprocess I/O failure (hard).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Returns true for errors that count as hard failures.
    ///
    /// `Resubmit` and `InsufficientTime` are deliberate stop conditions, not
    /// defects, and leave the job eligible for requeueing.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExecError::Resubmit(_) | ExecError::InsufficientTime(_))
    }
}

/// Structural misuse of the job graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node can belong to at most one parent.
    #[error("node '{0}' is already attached to a parent")]
    AlreadyParented(String),

    /// Children can only be added to a workspace.
    #[error("node '{0}' is not a workspace")]
    NotAWorkspace(String),

    /// Only one root node may be active per process.
    #[error("another root node is already attached")]
    RootAttached,
}

impl From<GraphError> for ExecError {
    fn from(e: GraphError) -> Self {
        ExecError::Failure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ExecError::Failure("boom".into()).is_fatal());
        assert!(!ExecError::Resubmit("try again".into()).is_fatal());
        assert!(!ExecError::InsufficientTime("5 min left".into()).is_fatal());
    }

    #[test]
    fn test_io_is_fatal() {
        let e = ExecError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        assert!(e.is_fatal());
    }

    #[test]
    fn test_graph_error_converts_to_failure() {
        let e: ExecError = GraphError::RootAttached.into();
        assert!(e.is_fatal());
        assert!(e.to_string().contains("root"));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ExecError::Failure("exit code: 1".into()).to_string(), "exit code: 1");
        assert!(ExecError::Resubmit("x".into()).to_string().starts_with("resubmit"));
    }
}
