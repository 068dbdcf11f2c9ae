//! Batch-Scheduler Adapters
//!
//! The engine never builds cluster-specific commands itself: a
//! [`BatchScheduler`] translates an abstract "run N processes with C cpus
//! and G gpus" request into a concrete launch command, submits job scripts,
//! and requeues a running allocation. One adapter is implemented per
//! cluster; [`LocalScheduler`] is the pass-through used by tests and for
//! running outside a batch system.

pub mod slurm;

use crate::config::JobConfig;
use crate::error::ExecError;
use crate::workflow::directory::Directory;

pub use slurm::SlurmScheduler;

/// Cluster-specific launch and submission commands.
pub trait BatchScheduler {
    /// CPUs available on one compute node.
    fn cpus_per_node(&self) -> usize;

    /// GPUs available on one compute node (0 on CPU-only clusters).
    fn gpus_per_node(&self) -> usize;

    /// Wraps a command with the cluster's multi-process launcher.
    fn mpiexec(&self, cmd: &str, nprocs: usize, cpus_per_proc: usize, gpus_per_proc: usize)
        -> String;

    /// Writes a submission script into `dir` and hands it to the batch
    /// scheduler.
    fn submit(&self, config: &JobConfig, dir: &Directory, cmd: &str) -> Result<(), ExecError>;

    /// Asks the batch scheduler to run the current allocation again.
    fn requeue(&self) -> Result<(), ExecError>;
}

/// Selects the adapter named by the configuration.
///
/// Unknown or absent cluster identifiers fall back to the local adapter.
pub fn from_config(config: &JobConfig) -> Box<dyn BatchScheduler> {
    match config.cluster.as_deref() {
        Some("slurm") => Box::new(SlurmScheduler::new(
            config.cpus_per_node.unwrap_or(SlurmScheduler::DEFAULT_CPUS),
            config.gpus_per_node.unwrap_or(0),
        )),
        _ => Box::new(LocalScheduler::new()),
    }
}

/// Pass-through adapter for running without a batch system.
///
/// Commands run unchanged, submission executes inline, and requeue is a
/// no-op.
#[derive(Debug, Default)]
pub struct LocalScheduler {
    cpus: usize,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            cpus: num_cpus::get(),
        }
    }

    /// An adapter pretending to have `cpus` CPUs per node, for tests.
    pub fn with_cpus(cpus: usize) -> Self {
        Self { cpus }
    }
}

impl BatchScheduler for LocalScheduler {
    fn cpus_per_node(&self) -> usize {
        self.cpus
    }

    fn gpus_per_node(&self) -> usize {
        0
    }

    fn mpiexec(
        &self,
        cmd: &str,
        _nprocs: usize,
        _cpus_per_proc: usize,
        _gpus_per_proc: usize,
    ) -> String {
        cmd.to_string()
    }

    fn submit(&self, _config: &JobConfig, _dir: &Directory, cmd: &str) -> Result<(), ExecError> {
        let status = std::process::Command::new("sh").arg("-c").arg(cmd).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failure(format!(
                "{}\nexit code: {:?}",
                cmd,
                status.code()
            )))
        }
    }

    fn requeue(&self) -> Result<(), ExecError> {
        log::info!("local scheduler: requeue is a no-op");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_mpiexec_is_passthrough() {
        let local = LocalScheduler::with_cpus(8);
        assert_eq!(local.mpiexec("echo hi", 4, 2, 0), "echo hi");
        assert_eq!(local.cpus_per_node(), 8);
        assert_eq!(local.gpus_per_node(), 0);
    }

    #[test]
    fn test_local_requeue_is_noop() {
        assert!(LocalScheduler::with_cpus(1).requeue().is_ok());
    }

    #[test]
    fn test_from_config_selects_adapter() {
        let mut config = JobConfig::default();
        assert_eq!(from_config(&config).gpus_per_node(), 0);

        config.cluster = Some("slurm".into());
        config.cpus_per_node = Some(128);
        config.gpus_per_node = Some(4);
        let scheduler = from_config(&config);
        assert_eq!(scheduler.cpus_per_node(), 128);
        assert_eq!(scheduler.gpus_per_node(), 4);
    }
}
