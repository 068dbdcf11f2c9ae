//! Execution Engine
//!
//! Drives a job tree to settlement on a single cooperative thread. All
//! shared state lives in an explicit [`JobContext`] threaded through the
//! run loop and down into task actions; there is no module-level mutable
//! state, and cross-process concerns (another allocation resuming the same
//! directory) remain the operator's responsibility.
//!
//! Errors never unwind through the tree. A task captures its error as data;
//! workspaces aggregate child states and the job-level policy at the end of
//! [`Engine::run`] decides between completion, requeue and failure.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{join_all, LocalBoxFuture};
use log::{debug, error, info, warn};

use crate::config::JobConfig;
use crate::error::{ExecError, GraphError};
use crate::execution::dispatcher::Dispatcher;
use crate::execution::walltime::Walltime;
use crate::scheduler::BatchScheduler;
use crate::workflow::checkpoint::Checkpoint;
use crate::workflow::directory::Directory;
use crate::workflow::node::{Node, NodeRef};

/// Names of the tasks currently executing, for status logging.
#[derive(Default)]
pub struct TaskMonitor {
    active: RefCell<Vec<String>>,
}

impl TaskMonitor {
    pub fn register(&self, name: &str) {
        self.active.borrow_mut().push(name.to_string());
        debug!("task started: {}", name);
    }

    pub fn deregister(&self, name: &str) {
        let mut active = self.active.borrow_mut();
        if let Some(i) = active.iter().position(|n| n == name) {
            active.remove(i);
        }
        debug!("task finished: {}", name);
    }

    /// Names of the running tasks, in start order.
    pub fn active(&self) -> Vec<String> {
        self.active.borrow().clone()
    }
}

/// Shared state of one job run.
///
/// Constructed once at startup and passed by `Rc` into every task action
/// that needs the dispatcher, the walltime clock or the configuration.
pub struct JobContext {
    pub config: JobConfig,
    pub scheduler: Box<dyn BatchScheduler>,
    pub dispatcher: Dispatcher,
    pub walltime: Walltime,
    pub checkpoint: Checkpoint,
    pub basedir: Directory,
    pub monitor: TaskMonitor,
    requeue_mode: bool,
    root: RefCell<Option<NodeRef>>,
}

impl JobContext {
    /// Builds the context for one allocation: the dispatcher sized to the
    /// granted nodes, the walltime clock started against the granted limit,
    /// and the checkpoint writer rooted at the job's base directory.
    pub fn new(
        config: JobConfig,
        scheduler: Box<dyn BatchScheduler>,
        basedir: Directory,
        requeue_mode: bool,
    ) -> Self {
        let dispatcher = Dispatcher::new(config.nnodes);
        let walltime = Walltime::new(config.walltime);
        let checkpoint = Checkpoint::new(basedir.clone());
        Self {
            config,
            scheduler,
            dispatcher,
            walltime,
            checkpoint,
            basedir,
            monitor: TaskMonitor::default(),
            requeue_mode,
            root: RefCell::new(None),
        }
    }

    /// Attaches the job's root node. A second root in the same process is
    /// refused; two trees cannot share one dispatcher and checkpoint.
    pub fn attach(&self, root: &NodeRef) -> Result<(), GraphError> {
        let mut slot = self.root.borrow_mut();
        if slot.is_some() {
            return Err(GraphError::RootAttached);
        }
        *slot = Some(root.clone());
        Ok(())
    }

    /// The attached root, if any.
    pub fn root(&self) -> Option<NodeRef> {
        self.root.borrow().clone()
    }

    /// CPUs per compute node: the config override if set, else the
    /// scheduler adapter's constant.
    pub fn cpus_per_node(&self) -> usize {
        self.config
            .cpus_per_node
            .unwrap_or_else(|| self.scheduler.cpus_per_node())
    }

    /// GPUs per compute node, resolved like [`JobContext::cpus_per_node`].
    pub fn gpus_per_node(&self) -> usize {
        self.config
            .gpus_per_node
            .unwrap_or_else(|| self.scheduler.gpus_per_node())
    }

    /// Whether insufficient walltime should stop the run for requeueing.
    /// Requires both the config opt-in and the resume-mode flag.
    pub fn requeue_active(&self) -> bool {
        self.requeue_mode && self.config.requeue
    }

    /// Writes a checkpoint immediately, if a root is attached.
    pub fn save(&self) -> io::Result<()> {
        match &*self.root.borrow() {
            Some(root) => self.checkpoint.save(root),
            None => Ok(()),
        }
    }

    /// Requests a debounced checkpoint write, if a root is attached.
    pub fn save_soon(&self) {
        if let Some(root) = &*self.root.borrow() {
            self.checkpoint.save_soon(root);
        }
    }
}

/// Runs a node to settlement. Already-done nodes are skipped, which is what
/// makes a restored tree resume instead of restart.
pub fn execute(ctx: Rc<JobContext>, node: NodeRef) -> LocalBoxFuture<'static, ()> {
    Box::pin(async move {
        let is_task = {
            let n = node.borrow();
            if n.done() {
                return;
            }
            matches!(&*n, Node::Task(_))
        };

        if is_task {
            execute_task(ctx, node).await;
        } else {
            execute_workspace(ctx, node).await;
        }
    })
}

async fn execute_task(ctx: Rc<JobContext>, node: NodeRef) {
    let (name, action, level) = {
        let n = node.borrow();
        let Node::Task(t) = &*n else { return };
        (t.name().to_string(), t.action(), n.level())
    };

    info!("{}{}", indent(level), name);
    ctx.monitor.register(&name);
    if let Node::Task(t) = &mut *node.borrow_mut() {
        t.begin();
    }
    ctx.save_soon();

    let result = action.call().await;

    if let Node::Task(t) = &mut *node.borrow_mut() {
        match result {
            Ok(()) => t.succeed(),
            Err(e) => {
                if e.is_fatal() {
                    error!("{}: {}", name, e);
                } else {
                    warn!("{}: {}", name, e);
                }
                t.fail(e);
            }
        }
    }
    ctx.monitor.deregister(&name);
    ctx.save_soon();
}

async fn execute_workspace(ctx: Rc<JobContext>, node: NodeRef) {
    let (name, concurrent, level) = {
        let n = node.borrow();
        let Node::Workspace(w) = &*n else { return };
        (w.name(), w.is_concurrent(), n.level())
    };
    info!("{}{}", indent(level), name);

    // Children added while the workspace runs are picked up by the next
    // round; children already attempted in this call are not retried.
    let mut attempted: Vec<NodeRef> = Vec::new();
    loop {
        let unfinished = {
            let n = node.borrow();
            let Node::Workspace(w) = &*n else { return };
            w.unfinished_excluding(&attempted)
        };
        if unfinished.is_empty() {
            break;
        }

        if concurrent {
            attempted.extend(unfinished.iter().cloned());
            join_all(
                unfinished
                    .iter()
                    .map(|child| execute(ctx.clone(), child.clone())),
            )
            .await;
        } else {
            let child = unfinished[0].clone();
            attempted.push(child.clone());
            execute(ctx.clone(), child.clone()).await;
            if child.borrow().exception_count() > 0 {
                debug!("{}: stopping after {}", name, child.borrow().name());
                break;
            }
        }
    }
}

fn indent(level: usize) -> String {
    "  ".repeat(level)
}

/// How a run ended, mapped by the caller onto a process exit code.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every node completed.
    Done,
    /// The run stopped on non-fatal conditions only and was handed back to
    /// the batch scheduler.
    Requeue,
    /// The run stopped with the given number of unresolved conditions.
    Failed(usize),
}

/// The job run loop.
pub struct Engine {
    ctx: Rc<JobContext>,
}

impl Engine {
    pub fn new(ctx: Rc<JobContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Rc<JobContext> {
        &self.ctx
    }

    /// Drives `root` to settlement and applies the job-level policy.
    ///
    /// The tree executes under a periodic tick that flushes debounced
    /// checkpoint writes, so a killed allocation loses at most a second of
    /// recorded progress. A run that stops with non-fatal conditions only
    /// (resubmits, insufficient time) is handed to the scheduler adapter
    /// for requeueing when requeue is active; anything else unfinished is a
    /// failure.
    pub async fn run(&self, root: NodeRef) -> Result<Outcome, ExecError> {
        self.ctx.attach(&root)?;
        info!(
            "{}: {} nodes, {:.0} min walltime",
            self.ctx.config.name, self.ctx.config.nnodes, self.ctx.config.walltime
        );
        self.ctx.save()?;

        let mut exec = execute(self.ctx.clone(), root.clone());
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = &mut exec => break,
                _ = ticker.tick() => self.ctx.checkpoint.flush(&root),
            }
        }
        self.ctx.save()?;

        let (done, errors, exceptions, report) = {
            let n = root.borrow();
            let report = match &*n {
                Node::Workspace(w) => w.info(),
                task => task.to_string(),
            };
            (n.done(), n.error_count(), n.exception_count(), report)
        };
        info!("\n{}", report);

        if done {
            Ok(Outcome::Done)
        } else if errors == 0 && exceptions > 0 && self.ctx.requeue_active() {
            info!("stopped on non-fatal conditions, requeueing");
            self.ctx.scheduler.requeue()?;
            Ok(Outcome::Requeue)
        } else {
            Ok(Outcome::Failed(errors.max(exceptions).max(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::LocalScheduler;
    use crate::workflow::node::State;
    use crate::workflow::workspace::{Workspace, WorkspaceExt};
    use tempfile::tempdir;

    fn context(requeue: bool) -> (Rc<JobContext>, tempfile::TempDir) {
        let tmp = tempdir().unwrap();
        let config = JobConfig {
            nnodes: 2,
            requeue,
            ..JobConfig::default()
        };
        let ctx = JobContext::new(
            config,
            Box::new(LocalScheduler::with_cpus(4)),
            Directory::new(tmp.path()),
            requeue,
        );
        (Rc::new(ctx), tmp)
    }

    fn child(node: &NodeRef, i: usize) -> NodeRef {
        match &*node.borrow() {
            Node::Workspace(w) => w.children()[i].clone(),
            Node::Task(_) => panic!("not a workspace"),
        }
    }

    #[tokio::test]
    async fn test_serial_short_circuit() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        root.add_fn("a", || Err(ExecError::Failure("boom".into())))
            .unwrap();
        root.add_fn("b", || Ok(())).unwrap();
        root.add_fn("c", || Ok(())).unwrap();

        execute(ctx, root.clone()).await;

        assert_eq!(child(&root, 0).borrow().state(), State::Failed);
        assert_eq!(child(&root, 1).borrow().state(), State::Idle);
        assert_eq!(child(&root, 2).borrow().state(), State::Idle);
        assert_eq!(root.borrow().state(), State::Failed);
        assert_eq!(root.borrow().error_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_all_to_settlement() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        let group = root
            .add(Node::Workspace(Workspace::concurrent("events")))
            .unwrap();
        group
            .add_fn("bad", || Err(ExecError::Failure("boom".into())))
            .unwrap();
        group.add_fn("good", || Ok(())).unwrap();

        execute(ctx, root.clone()).await;

        assert_eq!(child(&group, 0).borrow().state(), State::Failed);
        assert_eq!(child(&group, 1).borrow().state(), State::Done);
        assert!(!root.borrow().done());
        assert_eq!(root.borrow().error_count(), 1);
        assert_eq!(root.borrow().exception_count(), 1);
    }

    #[tokio::test]
    async fn test_serial_order_and_completion() {
        let (ctx, _tmp) = context(false);
        let order = Rc::new(RefCell::new(Vec::new()));
        let root = Workspace::new_root("job");
        for name in ["one", "two", "three"] {
            let order = order.clone();
            root.add_fn(name, move || {
                order.borrow_mut().push(name);
                Ok(())
            })
            .unwrap();
        }

        execute(ctx, root.clone()).await;

        assert_eq!(*order.borrow(), vec!["one", "two", "three"]);
        assert!(root.borrow().done());
    }

    #[tokio::test]
    async fn test_resubmit_pauses_without_counting_as_error() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        root.add_fn("flaky", || Err(ExecError::Resubmit("later".into())))
            .unwrap();

        execute(ctx, root.clone()).await;

        assert_eq!(child(&root, 0).borrow().state(), State::Paused);
        assert_eq!(root.borrow().state(), State::Paused);
        assert_eq!(root.borrow().error_count(), 0);
        assert_eq!(root.borrow().exception_count(), 1);
    }

    #[tokio::test]
    async fn test_done_children_are_skipped() {
        let (ctx, _tmp) = context(false);
        let calls = Rc::new(RefCell::new(0));
        let root = Workspace::new_root("job");
        let counted = calls.clone();
        let task = root
            .add_fn("once", move || {
                *counted.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();

        execute(ctx.clone(), root.clone()).await;
        assert_eq!(task.borrow().state(), State::Done);

        execute(ctx, root.clone()).await;
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn test_engine_run_done() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        root.add_fn("t", || Ok(())).unwrap();

        let engine = Engine::new(ctx.clone());
        let outcome = engine.run(root).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(ctx.checkpoint.exists());
    }

    #[tokio::test]
    async fn test_engine_run_requeues_on_soft_stop() {
        let (ctx, _tmp) = context(true);
        let root = Workspace::new_root("job");
        root.add_fn("flaky", || Err(ExecError::InsufficientTime("5 min".into())))
            .unwrap();

        let outcome = Engine::new(ctx).run(root).await.unwrap();
        assert_eq!(outcome, Outcome::Requeue);
    }

    #[tokio::test]
    async fn test_engine_run_fails_on_hard_error() {
        let (ctx, _tmp) = context(true);
        let root = Workspace::new_root("job");
        root.add_fn("bad", || Err(ExecError::Failure("boom".into())))
            .unwrap();

        let outcome = Engine::new(ctx).run(root).await.unwrap();
        assert_eq!(outcome, Outcome::Failed(1));
    }

    #[tokio::test]
    async fn test_engine_soft_stop_without_requeue_fails() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        root.add_fn("flaky", || Err(ExecError::Resubmit("later".into())))
            .unwrap();

        let outcome = Engine::new(ctx).run(root).await.unwrap();
        assert_eq!(outcome, Outcome::Failed(1));
    }

    #[test]
    fn test_attach_refuses_second_root() {
        let (ctx, _tmp) = context(false);
        let first = Workspace::new_root("one");
        let second = Workspace::new_root("two");

        ctx.attach(&first).unwrap();
        assert!(matches!(
            ctx.attach(&second),
            Err(GraphError::RootAttached)
        ));
    }

    #[test]
    fn test_node_constants_prefer_config_override() {
        let (ctx, _tmp) = context(false);
        assert_eq!(ctx.cpus_per_node(), 4);

        let tmp = tempdir().unwrap();
        let config = JobConfig {
            cpus_per_node: Some(128),
            gpus_per_node: Some(6),
            ..JobConfig::default()
        };
        let ctx = JobContext::new(
            config,
            Box::new(LocalScheduler::with_cpus(4)),
            Directory::new(tmp.path()),
            false,
        );
        assert_eq!(ctx.cpus_per_node(), 128);
        assert_eq!(ctx.gpus_per_node(), 6);
    }

    #[tokio::test]
    async fn test_monitor_tracks_running_tasks() {
        let (ctx, _tmp) = context(false);
        let root = Workspace::new_root("job");
        let observer = ctx.clone();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        root.add_async("watched", move || {
            let observer = observer.clone();
            let record = record.clone();
            Box::pin(async move {
                record.borrow_mut().extend(observer.monitor.active());
                Ok(())
            })
        })
        .unwrap();

        execute(ctx.clone(), root).await;
        assert_eq!(*seen.borrow(), vec!["watched".to_string()]);
        assert!(ctx.monitor.active().is_empty());
    }
}
