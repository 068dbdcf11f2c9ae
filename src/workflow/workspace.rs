//! Workspace: Composite Node + Directory Scope
//!
//! A workspace owns an ordered list of child nodes and a filesystem path
//! rooted relative to its parent. Children run either strictly in sequence
//! (stopping at the first captured error) or all concurrently (every sibling
//! runs to settlement).
//!
//! # Attribute resolution
//!
//! Reading a named parameter with [`Workspace::get`] walks a fixed chain:
//! local store → constructor parameters → parent chain → the `[workspace]`
//! table of the job configuration. Nested workspaces inherit and override
//! parameters without duplicating them; the order is a contract, not an
//! implementation detail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::Value;

use crate::config::JobConfig;
use crate::error::{ExecError, GraphError};
use crate::workflow::directory::Directory;
use crate::workflow::node::{Node, NodeRef, ParentRef, State};
use crate::workflow::task::{Action, Task};

/// A composite node holding an ordered collection of children.
pub struct Workspace {
    name: Option<String>,
    cwd: String,
    concurrent: bool,
    children: Vec<NodeRef>,
    params: HashMap<String, Value>,
    store: HashMap<String, Value>,
    parent: ParentRef,
}

impl Workspace {
    /// Creates a serial workspace scoped at `cwd` (relative to its parent).
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            name: None,
            cwd: cwd.into(),
            concurrent: false,
            children: Vec::new(),
            params: HashMap::new(),
            store: HashMap::new(),
            parent: ParentRef::new(),
        }
    }

    /// Creates a concurrent workspace: all children are scheduled together
    /// and awaited to settlement, with no short-circuit on failure.
    pub fn concurrent(cwd: impl Into<String>) -> Self {
        Self {
            concurrent: true,
            ..Self::new(cwd)
        }
    }

    /// Creates the job's root workspace, already wrapped as a node.
    pub fn new_root(name: impl Into<String>) -> NodeRef {
        let ws = Self::new(".").with_name(name);
        Rc::new(std::cell::RefCell::new(Node::Workspace(ws)))
    }

    /// Overrides the derived display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets a constructor parameter, visible to this workspace and its
    /// descendants through the resolution chain.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Display name: the override if set, else the last path component.
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Path::new(&self.cwd)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn parent(&self) -> &ParentRef {
        &self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ParentRef) {
        self.parent = parent;
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// The ordered child list.
    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Path of this workspace relative to the job root.
    pub fn rel(&self) -> PathBuf {
        let base = self
            .parent
            .upgrade()
            .and_then(|parent| match &*parent.borrow() {
                Node::Workspace(p) => Some(p.rel()),
                Node::Task(_) => None,
            });
        match base {
            Some(base) if self.cwd == "." => base,
            Some(base) if base == Path::new(".") => PathBuf::from(&self.cwd),
            Some(base) => base.join(&self.cwd),
            None => PathBuf::from(&self.cwd),
        }
    }

    /// The directory scope of this workspace under the job's base directory.
    pub fn directory(&self, base: &Directory) -> Directory {
        base.subdir(self.rel())
    }

    /// Resolves a named parameter through the documented chain:
    /// local store → constructor parameters → parent chain → `[workspace]`
    /// config table.
    pub fn get(&self, config: &JobConfig, key: &str) -> Option<Value> {
        if let Some(value) = self.store.get(key) {
            return Some(value.clone());
        }
        if let Some(value) = self.params.get(key) {
            return Some(value.clone());
        }
        if let Some(parent) = self.parent.upgrade() {
            if let Node::Workspace(p) = &*parent.borrow() {
                if let Some(value) = p.get(config, key) {
                    return Some(value);
                }
            }
        }
        config.workspace.get(key).cloned()
    }

    /// Writes a run-time value into the local store.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.insert(key.into(), value.into());
    }

    /// Removes a run-time value from the local store.
    pub fn unset(&mut self, key: &str) {
        self.store.remove(key);
    }

    pub(crate) fn store(&self) -> &HashMap<String, Value> {
        &self.store
    }

    pub(crate) fn restore_store(&mut self, store: HashMap<String, Value>) {
        self.store = store;
    }

    /// Children that have not completed.
    pub fn unfinished(&self) -> Vec<NodeRef> {
        self.children
            .iter()
            .filter(|c| !c.borrow().done())
            .cloned()
            .collect()
    }

    /// Children that have not completed, excluding ones already attempted in
    /// the current pass.
    pub fn unfinished_excluding(&self, exclude: &[NodeRef]) -> Vec<NodeRef> {
        self.children
            .iter()
            .filter(|c| !c.borrow().done() && !exclude.iter().any(|e| Rc::ptr_eq(e, c)))
            .cloned()
            .collect()
    }

    /// Aggregate state derived from the children.
    pub fn state(&self) -> State {
        let unfinished = self.unfinished();
        if unfinished.is_empty() {
            return State::Done;
        }

        let mut fatal = 0;
        let mut soft = 0;
        for child in &unfinished {
            let child = child.borrow();
            if child.running() {
                return State::Running;
            }
            if child.error_count() > 0 {
                fatal += 1;
            } else if child.exception_count() > 0 {
                soft += 1;
            }
        }

        if fatal > 0 {
            State::Failed
        } else if soft > 0 {
            State::Paused
        } else {
            State::Idle
        }
    }

    /// Deletes child nodes (optionally preserving the first, typically a
    /// directory-creation step) and clears the local store. Used when a job
    /// definition is rebuilt deterministically on resume.
    pub fn clear(&mut self, keep_first: bool) {
        if keep_first {
            self.children.truncate(1);
        } else {
            self.children.clear();
        }
        self.store.clear();
    }

    /// Resets the last `n` attempted (non-Idle) children, scanning from the
    /// end of the list. Stops early when the scan reaches the front without
    /// finding one.
    pub fn rewind(&mut self, n: usize) {
        for _ in 0..n {
            for i in (0..self.children.len()).rev() {
                let state = self.children[i].borrow().state();
                if state != State::Idle {
                    self.children[i].borrow_mut().reset();
                    break;
                }
                if i == 0 {
                    return;
                }
            }
        }
    }

    /// Indented status tree for the end-of-run report. Finished subtrees are
    /// collapsed to a single line.
    pub fn info(&self) -> String {
        let mut out = format!("{} ({})", self.name(), self.state());
        let width = (self.children.len() + 1).to_string().len();

        for (i, child) in self.children.iter().enumerate() {
            let prefix = if self.concurrent {
                "- ".to_string()
            } else {
                format!("{:0width$}) ", i + 1, width = width)
            };

            out.push('\n');
            out.push_str(&prefix);

            let child = child.borrow();
            match &*child {
                Node::Workspace(w) if !child.done() => {
                    let nested = w.info();
                    let mut lines = nested.lines();
                    if let Some(first) = lines.next() {
                        out.push_str(first);
                    }
                    for line in lines {
                        out.push('\n');
                        out.push_str("  ");
                        out.push_str(line);
                    }
                }
                _ => out.push_str(&child.to_string()),
            }
        }

        out
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name())
            .field("concurrent", &self.concurrent)
            .field("children", &self.children.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Tree-building operations on a workspace node handle.
///
/// `add` is the only way a node acquires a parent; a node already attached
/// elsewhere is rejected.
pub trait WorkspaceExt {
    /// Adds a child node, returning its handle.
    fn add(&self, child: Node) -> Result<NodeRef, GraphError>;

    /// Adds a pre-built task.
    fn add_task(&self, task: Task) -> Result<NodeRef, GraphError>;

    /// Wraps a plain function into a task and adds it.
    fn add_fn(
        &self,
        name: &str,
        f: impl Fn() -> Result<(), ExecError> + 'static,
    ) -> Result<NodeRef, GraphError>;

    /// Wraps a future-producing function into a task and adds it.
    fn add_async(
        &self,
        name: &str,
        f: impl Fn() -> futures::future::LocalBoxFuture<'static, Result<(), ExecError>> + 'static,
    ) -> Result<NodeRef, GraphError>;
}

impl WorkspaceExt for NodeRef {
    fn add(&self, child: Node) -> Result<NodeRef, GraphError> {
        if child.has_parent() {
            return Err(GraphError::AlreadyParented(child.name()));
        }

        let child = Rc::new(std::cell::RefCell::new(child));
        child.borrow_mut().set_parent(Rc::downgrade(self));

        match &mut *self.borrow_mut() {
            Node::Workspace(ws) => {
                ws.children.push(child.clone());
                Ok(child)
            }
            node => Err(GraphError::NotAWorkspace(node.name())),
        }
    }

    fn add_task(&self, task: Task) -> Result<NodeRef, GraphError> {
        self.add(Node::Task(task))
    }

    fn add_fn(
        &self,
        name: &str,
        f: impl Fn() -> Result<(), ExecError> + 'static,
    ) -> Result<NodeRef, GraphError> {
        self.add_task(Task::new(name, Action::sync(f)))
    }

    fn add_async(
        &self,
        name: &str,
        f: impl Fn() -> futures::future::LocalBoxFuture<'static, Result<(), ExecError>> + 'static,
    ) -> Result<NodeRef, GraphError> {
        self.add_task(Task::new(name, Action::asynchronous(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done_task(name: &str) -> Task {
        let mut task = Task::new(name, Action::sync(|| Ok(())));
        task.begin();
        task.succeed();
        task
    }

    #[test]
    fn test_add_sets_parent_once() {
        let root = Workspace::new_root("job");
        let child = root.add_fn("t", || Ok(())).unwrap();
        assert!(child.borrow().has_parent());
        assert_eq!(child.borrow().level(), 1);
    }

    #[test]
    fn test_add_to_task_is_rejected() {
        let root = Workspace::new_root("job");
        let leaf = root.add_fn("t", || Ok(())).unwrap();
        assert!(matches!(
            leaf.add(Node::Task(Task::new("x", Action::sync(|| Ok(()))))),
            Err(GraphError::NotAWorkspace(_))
        ));
    }

    #[test]
    fn test_resolution_order() {
        let mut config = JobConfig::default();
        config
            .workspace
            .insert("key".into(), Value::from("from-config"));

        let root = Workspace::new_root("job");
        let mid = root
            .add(Node::Workspace(
                Workspace::new("mid").with_param("key", "from-param"),
            ))
            .unwrap();
        let leaf = mid.add(Node::Workspace(Workspace::new("leaf"))).unwrap();

        // Global fallback.
        let empty = Workspace::new("lone");
        assert_eq!(empty.get(&config, "key"), Some(Value::from("from-config")));

        // Parent chain beats global config.
        {
            let n = leaf.borrow();
            let Node::Workspace(w) = &*n else { unreachable!() };
            assert_eq!(w.get(&config, "key"), Some(Value::from("from-param")));
        }

        // Local store beats constructor params.
        {
            let mut n = mid.borrow_mut();
            let Node::Workspace(w) = &mut *n else { unreachable!() };
            w.set("key", "from-store");
            assert_eq!(w.get(&config, "key"), Some(Value::from("from-store")));
        }

        // And the child sees the override too.
        {
            let n = leaf.borrow();
            let Node::Workspace(w) = &*n else { unreachable!() };
            assert_eq!(w.get(&config, "key"), Some(Value::from("from-store")));
        }
    }

    #[test]
    fn test_rel_paths() {
        let root = Workspace::new_root("job");
        let stage = root.add(Node::Workspace(Workspace::new("stage"))).unwrap();
        let inner = stage
            .add(Node::Workspace(Workspace::new("events/ev01")))
            .unwrap();

        let n = inner.borrow();
        let Node::Workspace(w) = &*n else { unreachable!() };
        assert_eq!(w.rel(), PathBuf::from("stage/events/ev01"));
    }

    #[test]
    fn test_aggregate_state() {
        let root = Workspace::new_root("job");
        root.add_task(done_task("a")).unwrap();
        let b = root.add_fn("b", || Ok(())).unwrap();

        assert_eq!(root.borrow().state(), State::Idle);

        if let Node::Task(t) = &mut *b.borrow_mut() {
            t.begin();
        }
        assert_eq!(root.borrow().state(), State::Running);

        if let Node::Task(t) = &mut *b.borrow_mut() {
            t.succeed();
        }
        assert_eq!(root.borrow().state(), State::Done);
    }

    #[test]
    fn test_rewind_resets_last_attempted() {
        let root = Workspace::new_root("job");
        root.add_fn("idle", || Ok(())).unwrap();
        let last = root.add_task(done_task("done")).unwrap();

        root.borrow_mut().reset();
        assert_eq!(last.borrow().state(), State::Idle);
    }

    #[test]
    fn test_rewind_noop_on_idle_tail() {
        let root = Workspace::new_root("job");
        let a = root.add_fn("a", || Ok(())).unwrap();
        let b = root.add_task(done_task("b")).unwrap();

        // First rewind resets exactly the Done child.
        if let Node::Workspace(w) = &mut *root.borrow_mut() {
            w.rewind(1);
        }
        assert_eq!(b.borrow().state(), State::Idle);
        assert_eq!(a.borrow().state(), State::Idle);

        // Second rewind finds only Idle nodes and returns without resetting.
        if let Node::Workspace(w) = &mut *root.borrow_mut() {
            w.rewind(1);
        }
        assert_eq!(a.borrow().state(), State::Idle);
        assert_eq!(b.borrow().state(), State::Idle);
    }

    #[test]
    fn test_clear_keep_first() {
        let root = Workspace::new_root("job");
        root.add_fn("mkdir", || Ok(())).unwrap();
        root.add_fn("solve", || Ok(())).unwrap();

        if let Node::Workspace(w) = &mut *root.borrow_mut() {
            w.set("iteration", 3);
            w.clear(true);
            assert_eq!(w.len(), 1);
            assert!(w.store().is_empty());
        };
    }

    #[test]
    fn test_info_renders_tree() {
        let root = Workspace::new_root("job");
        root.add_task(done_task("prepare")).unwrap();
        let group = root
            .add(Node::Workspace(Workspace::concurrent("events")))
            .unwrap();
        group.add_fn("ev01", || Ok(())).unwrap();
        group.add_fn("ev02", || Ok(())).unwrap();

        let n = root.borrow();
        let Node::Workspace(w) = &*n else { unreachable!() };
        let info = w.info();
        assert!(info.starts_with("job (idle)"));
        assert!(info.contains("1) prepare (done)"));
        assert!(info.contains("- ev01"));
    }
}
