//! Checkpoint Schema and Debounced Writer
//!
//! The job tree is persisted as an explicit snapshot schema (a tagged tree
//! of kind, name, timestamps, captured error, and children) independent of
//! the in-memory representation. Resume rebuilds the tree from code, then
//! applies a snapshot onto it; the two stay compatible across code changes
//! as long as names and ordering line up.
//!
//! Writes after state transitions go through [`Checkpoint::save_soon`],
//! which debounces rapid churn to at most one write per second and leaves a
//! pending write for the engine's periodic flush timer.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecError;
use crate::workflow::directory::Directory;
use crate::workflow::node::{Node, NodeRef};

/// File name of the serialized job tree inside the base directory.
pub const CHECKPOINT_FILE: &str = "job.json";

/// Minimum interval between checkpoint writes under rapid churn.
const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Serializable classification of a captured error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Failure,
    Resubmit,
    InsufficientTime,
}

/// A captured error as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SavedError {
    fn of(error: &ExecError) -> Self {
        let kind = match error {
            ExecError::Resubmit(_) => ErrorKind::Resubmit,
            ExecError::InsufficientTime(_) => ErrorKind::InsufficientTime,
            ExecError::Failure(_) | ExecError::Io(_) => ErrorKind::Failure,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }

    fn to_error(&self) -> ExecError {
        match self.kind {
            ErrorKind::Failure => ExecError::Failure(self.message.clone()),
            ErrorKind::Resubmit => ExecError::Resubmit(self.message.clone()),
            ErrorKind::InsufficientTime => ExecError::InsufficientTime(self.message.clone()),
        }
    }
}

/// One node of the serialized job tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSnapshot {
    Task {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SavedError>,
    },
    Workspace {
        name: String,
        concurrent: bool,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        store: HashMap<String, Value>,
        children: Vec<NodeSnapshot>,
    },
}

/// Captures the current state of a node tree.
pub fn snapshot(node: &NodeRef) -> NodeSnapshot {
    match &*node.borrow() {
        Node::Task(t) => NodeSnapshot::Task {
            name: t.name().to_string(),
            started: t.started(),
            ended: t.ended(),
            error: t.error().map(SavedError::of),
        },
        Node::Workspace(w) => NodeSnapshot::Workspace {
            name: w.name(),
            concurrent: w.is_concurrent(),
            store: w.store().clone(),
            children: w.children().iter().map(snapshot).collect(),
        },
    }
}

/// Applies a snapshot onto a freshly rebuilt tree.
///
/// Tasks are matched by name, workspace children by position; a mismatch is
/// logged and skipped so a changed job definition degrades to re-running the
/// unmatched region instead of failing the resume.
pub fn restore(node: &NodeRef, snap: &NodeSnapshot) {
    match (&mut *node.borrow_mut(), snap) {
        (
            Node::Task(t),
            NodeSnapshot::Task {
                name,
                started,
                ended,
                error,
            },
        ) => {
            if t.name() != name {
                warn!("checkpoint task '{}' does not match '{}'", name, t.name());
                return;
            }
            t.restore(*started, *ended, error.as_ref().map(SavedError::to_error));
        }
        (Node::Workspace(w), NodeSnapshot::Workspace { name, store, children, .. }) => {
            if w.name() != *name {
                warn!(
                    "checkpoint workspace '{}' does not match '{}'",
                    name,
                    w.name()
                );
                return;
            }
            w.restore_store(store.clone());
            if w.len() != children.len() {
                warn!(
                    "workspace '{}' has {} children, checkpoint has {}",
                    name,
                    w.len(),
                    children.len()
                );
            }
            for (child, child_snap) in w.children().iter().zip(children) {
                restore(child, child_snap);
            }
        }
        (node, _) => {
            warn!("checkpoint kind mismatch at '{}'", node.name());
        }
    }
}

/// Debounced writer of the job snapshot.
pub struct Checkpoint {
    dir: Directory,
    last_write: Cell<Option<Instant>>,
    pending: Cell<bool>,
}

impl Checkpoint {
    /// Creates a writer targeting `job.json` in `dir`.
    pub fn new(dir: Directory) -> Self {
        Self {
            dir,
            last_write: Cell::new(None),
            pending: Cell::new(false),
        }
    }

    /// Whether a checkpoint file exists.
    pub fn exists(&self) -> bool {
        self.dir.has(CHECKPOINT_FILE)
    }

    /// Reads the stored snapshot.
    pub fn load(&self) -> io::Result<NodeSnapshot> {
        self.dir.load_json(CHECKPOINT_FILE)
    }

    /// Writes the snapshot immediately, fsynced.
    pub fn save(&self, root: &NodeRef) -> io::Result<()> {
        self.dir.write_json(CHECKPOINT_FILE, &snapshot(root))?;
        self.last_write.set(Some(Instant::now()));
        self.pending.set(false);
        Ok(())
    }

    /// Writes the snapshot unless the last write is under one second old, in
    /// which case the write is left pending for [`Checkpoint::flush`].
    /// Write failures are logged, not raised: a missed checkpoint must not
    /// fail the run.
    pub fn save_soon(&self, root: &NodeRef) {
        let recent = self
            .last_write
            .get()
            .is_some_and(|t| t.elapsed() < DEBOUNCE_INTERVAL);

        if recent {
            self.pending.set(true);
            debug!("checkpoint debounced");
            return;
        }

        if let Err(e) = self.save(root) {
            warn!("checkpoint write failed: {}", e);
        }
    }

    /// Performs a pending debounced write, if any.
    pub fn flush(&self, root: &NodeRef) {
        if self.pending.get() {
            if let Err(e) = self.save(root) {
                warn!("checkpoint flush failed: {}", e);
            }
        }
    }

    /// Whether a debounced write is waiting for the flush timer.
    pub fn pending(&self) -> bool {
        self.pending.get()
    }
}
