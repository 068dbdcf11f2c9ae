//! Node State Machine
//!
//! A `Node` is one executable unit in the job tree: either a leaf [`Task`]
//! or a composite [`Workspace`]. Nodes form a strict tree: children are
//! owned by their workspace, the parent link is a non-owning back-pointer
//! set exactly once when the node is added.
//!
//! State is derived, never stored: a node is `Done`, `Running`, `Failed` or
//! `Paused` depending on its timestamps and captured error (tasks) or on the
//! aggregate of its unfinished children (workspaces).

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::workflow::task::Task;
use crate::workflow::workspace::Workspace;

/// Shared handle to a node in the job tree.
pub type NodeRef = Rc<RefCell<Node>>;

/// Non-owning back-pointer to a parent node.
pub type ParentRef = Weak<RefCell<Node>>;

/// Execution state derived from a node's recorded progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Never started (or reset).
    Idle,
    /// Started and not yet settled.
    Running,
    /// Completed without error.
    Done,
    /// Ended with a hard failure.
    Failed,
    /// Ended with a non-fatal condition (resubmit or insufficient time).
    Paused,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Done => "done",
            State::Failed => "failed",
            State::Paused => "paused",
        };
        f.write_str(label)
    }
}

/// One executable unit in the job tree.
pub enum Node {
    Task(Task),
    Workspace(Workspace),
}

impl Node {
    /// Display name of the node.
    pub fn name(&self) -> String {
        match self {
            Node::Task(t) => t.name().to_string(),
            Node::Workspace(w) => w.name(),
        }
    }

    /// Derived execution state.
    pub fn state(&self) -> State {
        match self {
            Node::Task(t) => t.state(),
            Node::Workspace(w) => w.state(),
        }
    }

    /// State rendered for display; running tasks may report probed progress
    /// instead of the plain state label.
    pub fn state_label(&self) -> String {
        match self {
            Node::Task(t) => t.state_label(),
            Node::Workspace(w) => w.state().to_string(),
        }
    }

    /// Whether the node completed without error.
    pub fn done(&self) -> bool {
        self.state() == State::Done
    }

    /// Whether the node is currently executing.
    pub fn running(&self) -> bool {
        self.state() == State::Running
    }

    /// The parent back-pointer.
    pub fn parent(&self) -> &ParentRef {
        match self {
            Node::Task(t) => t.parent(),
            Node::Workspace(w) => w.parent(),
        }
    }

    pub(crate) fn set_parent(&mut self, parent: ParentRef) {
        match self {
            Node::Task(t) => t.set_parent(parent),
            Node::Workspace(w) => w.set_parent(parent),
        }
    }

    /// Whether the node has been attached to a parent.
    pub fn has_parent(&self) -> bool {
        self.parent().upgrade().is_some()
    }

    /// Depth of the node below the root.
    pub fn level(&self) -> usize {
        let mut level = 0;
        let mut current = self.parent().upgrade();
        while let Some(node) = current {
            level += 1;
            current = node.borrow().parent().upgrade();
        }
        level
    }

    /// Number of hard failures carried by this node (tasks: 0 or 1;
    /// workspaces: unfinished children carrying a hard failure).
    pub fn error_count(&self) -> usize {
        match self {
            Node::Task(t) => t.error().map_or(0, |e| e.is_fatal() as usize),
            Node::Workspace(w) => w
                .unfinished()
                .iter()
                .filter(|c| c.borrow().error_count() > 0)
                .count(),
        }
    }

    /// Number of captured conditions of any kind, non-fatal ones included.
    pub fn exception_count(&self) -> usize {
        match self {
            Node::Task(t) => t.error().is_some() as usize,
            Node::Workspace(w) => w
                .unfinished()
                .iter()
                .filter(|c| c.borrow().exception_count() > 0)
                .count(),
        }
    }

    /// Returns the node to `Idle`. For workspaces this rewinds every child.
    pub fn reset(&mut self) {
        match self {
            Node::Task(t) => t.reset(),
            Node::Workspace(w) => {
                let n = w.len();
                w.rewind(n);
            }
        }
    }

    /// Resets any node still recorded as `Running`, recursively. Applied
    /// after restoring a checkpoint so interrupted work is re-attempted.
    pub fn clear_unfinished(&mut self) {
        match self {
            Node::Task(t) => {
                if t.state() == State::Running {
                    t.reset();
                }
            }
            Node::Workspace(w) => {
                for child in w.children() {
                    child.borrow_mut().clear_unfinished();
                }
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            State::Idle => write!(f, "{}", self.name()),
            _ => write!(f, "{} ({})", self.name(), self.state_label()),
        }
    }
}
