//! Resource-Aware Dispatcher
//!
//! Admission control for multi-process work under the allocation's node
//! budget. Every distributed launch holds a [`Ticket`] for the nodes it
//! occupies; demand that does not fit is parked and its caller suspended
//! until capacity frees up. Released capacity is handed out greedily to the
//! largest pending demand first, which packs better than FIFO but can
//! starve a large request under constant churn of small ones. A known
//! limitation of the policy, kept deliberately.
//!
//! All admission state lives on the single cooperative thread; mutations
//! never span a suspension point, so no locking is involved.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::sync::oneshot;

use crate::error::ExecError;
use crate::execution::engine::JobContext;
use crate::execution::walltime::Budget;
use crate::workflow::directory::Directory;

/// The work launched by one `mpiexec` call.
#[derive(Debug, Clone)]
pub enum MpiWork {
    /// A literal shell command, run in the task's working directory.
    Command(String),
    /// A named entry point registered with the engine, bootstrapped in a
    /// fresh process so remote failures can report through a sidecar file.
    Entry(String),
}

/// An outstanding claim on cluster node capacity.
///
/// Held from admission until the subprocess settles; returned to
/// [`Dispatcher::release`] by value so a claim cannot be released twice.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    nnodes: usize,
}

impl Ticket {
    /// Node demand of this claim.
    pub fn nnodes(&self) -> usize {
        self.nnodes
    }
}

struct Waiter {
    id: u64,
    nnodes: usize,
    tx: oneshot::Sender<()>,
}

/// Admission control over the allocation's total node count.
pub struct Dispatcher {
    total: usize,
    running: RefCell<HashMap<u64, usize>>,
    pending: RefCell<Vec<Waiter>>,
    next_id: Cell<u64>,
}

impl Dispatcher {
    /// Creates a dispatcher over `total` allocated nodes.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            running: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Nodes granted to the allocation.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Nodes currently claimed by running tickets.
    pub fn running_nodes(&self) -> usize {
        self.running.borrow().values().sum()
    }

    /// Number of parked tickets.
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Claims `nnodes` nodes, suspending until capacity is available.
    ///
    /// Demand exceeding the whole allocation can never be satisfied and
    /// fails immediately instead of queueing.
    pub async fn acquire(&self, nnodes: usize) -> Result<Ticket, ExecError> {
        if nnodes > self.total {
            return Err(ExecError::Failure(format!(
                "insufficient nodes ({} requested, {} allocated)",
                nnodes, self.total
            )));
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        if self.try_admit(id, nnodes) {
            return Ok(Ticket { id, nnodes });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().push(Waiter { id, nnodes, tx });
        debug!("ticket {} parked ({} nodes)", id, nnodes);

        rx.await
            .map_err(|_| ExecError::Failure("dispatcher dropped a parked ticket".to_string()))?;
        Ok(Ticket { id, nnodes })
    }

    /// Returns a claim and admits as much parked demand as now fits.
    pub fn release(&self, ticket: Ticket) {
        self.running.borrow_mut().remove(&ticket.id);
        self.pending.borrow_mut().retain(|w| w.id != ticket.id);
        self.dispatch();
    }

    fn try_admit(&self, id: u64, nnodes: usize) -> bool {
        let mut running = self.running.borrow_mut();
        let used: usize = running.values().sum();
        if used + nnodes <= self.total {
            running.insert(id, nnodes);
            true
        } else {
            false
        }
    }

    /// One dispatch pass: largest pending demand first, stable for equal
    /// demand, admitting everything that fits right now.
    fn dispatch(&self) {
        let mut waiters: Vec<Waiter> = self.pending.borrow_mut().drain(..).collect();
        waiters.sort_by(|a, b| b.nnodes.cmp(&a.nnodes));

        let mut parked = Vec::new();
        for waiter in waiters {
            if self.try_admit(waiter.id, waiter.nnodes) {
                debug!("ticket {} admitted ({} nodes)", waiter.id, waiter.nnodes);
                let _ = waiter.tx.send(());
            } else {
                parked.push(waiter);
            }
        }

        // Restore arrival order so later passes stay stable.
        parked.sort_by_key(|w| w.id);
        *self.pending.borrow_mut() = parked;
    }
}

impl JobContext {
    /// Launches a multi-process work unit under the node budget.
    ///
    /// Blocks (cooperatively) until nodes are available, verifies the
    /// remaining walltime covers `budget` before spawning anything, runs the
    /// work through the scheduler adapter's launcher with output captured to
    /// a per-task log, and classifies the outcome. With `resubmit` set,
    /// launch failures become resubmit conditions instead of hard failures.
    #[allow(clippy::too_many_arguments)]
    pub async fn mpiexec(
        &self,
        dir: &Directory,
        work: MpiWork,
        nprocs: usize,
        cpus_per_proc: usize,
        gpus_per_proc: usize,
        budget: Option<Budget>,
        resubmit: bool,
    ) -> Result<(), ExecError> {
        let budget = budget.and_then(|b| b.resolve(&self.config));

        let cpus_per_node = self.cpus_per_node().max(1);
        let mut nnodes = (nprocs * cpus_per_proc).div_ceil(cpus_per_node);
        if gpus_per_proc > 0 {
            let gpus_per_node = self.gpus_per_node();
            if gpus_per_node == 0 {
                return Err(ExecError::Failure(
                    "gpus requested on a cluster without gpus".to_string(),
                ));
            }
            nnodes = nnodes.max((nprocs * gpus_per_proc).div_ceil(gpus_per_node));
        }

        let ticket = self.dispatcher.acquire(nnodes.max(1)).await?;
        let result = self
            .launch(dir, work, nprocs, cpus_per_proc, gpus_per_proc, budget, resubmit)
            .await;
        self.dispatcher.release(ticket);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        dir: &Directory,
        work: MpiWork,
        nprocs: usize,
        cpus_per_proc: usize,
        gpus_per_proc: usize,
        budget: Option<f64>,
        resubmit: bool,
    ) -> Result<(), ExecError> {
        // The walltime gate sits after admission so a long queue wait cannot
        // sneak an uncoverable launch past an earlier check.
        self.walltime.ensure(budget, self.requeue_active())?;

        let (cmd, run_in_dir, fid) = match work {
            MpiWork::Command(cmd) => (cmd, true, "mpiexec".to_string()),
            MpiWork::Entry(name) => {
                let fid = format!("mpiexec.{}", name);
                remove_stale(dir, &fid)?;
                dir.write(format!("{}.task", fid), &name)?;
                (bootstrap_command(dir, &fid)?, false, fid)
            }
        };

        let cmd = self
            .scheduler
            .mpiexec(&cmd, nprocs, cpus_per_proc, gpus_per_proc);
        let logfile = format!("{}.out", fid);
        dir.append(&logfile, &format!("\n{}\n\n", cmd))?;

        let out = dir.open_append(&logfile)?;
        let err = out.try_clone()?;
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));
        if run_in_dir {
            dir.mkdir(".")?;
            command.current_dir(dir.path());
        }

        let launched = Instant::now();
        let mut child = command.spawn()?;

        let status = if budget.is_some() && self.requeue_active() {
            // Bound the wait by the remaining walltime, less a minute to shut
            // down cleanly; the budget itself is the floor.
            let limit = budget
                .unwrap_or_default()
                .max(self.walltime.remaining() - 1.0)
                .max(0.0);
            match tokio::time::timeout(Duration::from_secs_f64(limit * 60.0), child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(ExecError::InsufficientTime(format!(
                        "gave up waiting for: {}",
                        cmd
                    )));
                }
            }
        } else {
            child.wait().await?
        };

        dir.append(
            &logfile,
            &format!("\nelapsed: {:.2} min\n", launched.elapsed().as_secs_f64() / 60.0),
        )?;

        // Remote ranks cannot raise across the process boundary; a sidecar
        // error file marks the task failed regardless of exit code.
        let sidecar = format!("{}.error", fid);
        if dir.has(&sidecar) {
            let message = dir.read(&sidecar)?;
            return Err(launch_error(message, resubmit));
        }

        if !status.success() {
            return Err(launch_error(
                format!("{}\nexit code: {:?}", cmd, status.code()),
                resubmit,
            ));
        }

        info!("completed: {}", cmd);
        Ok(())
    }
}

fn launch_error(message: String, resubmit: bool) -> ExecError {
    if resubmit {
        ExecError::Resubmit(message)
    } else {
        ExecError::Failure(message)
    }
}

/// Command that re-invokes the engine's entry point to run a registered
/// task under the launcher.
fn bootstrap_command(dir: &Directory, fid: &str) -> std::io::Result<String> {
    let exe = std::env::current_exe()?;
    Ok(format!(
        "{} --remote {}:{}",
        exe.display(),
        dir.abs(".")?.display(),
        fid
    ))
}

/// Removes artifacts of a previous attempt (`<fid>.task`, `.out`, `.error`).
fn remove_stale(dir: &Directory, fid: &str) -> std::io::Result<()> {
    let prefix = format!("{}.", fid);
    if let Ok(entries) = dir.ls(".") {
        for entry in entries {
            if entry.starts_with(&prefix) {
                dir.remove(&entry)?;
            }
        }
    }
    Ok(())
}
