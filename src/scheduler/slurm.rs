//! Slurm Adapter
//!
//! Builds `srun` launch commands, `sbatch` submission scripts, and requeues
//! the running allocation through `scontrol` using the job id Slurm exports
//! into the environment.

use std::process::Command;

use crate::config::JobConfig;
use crate::error::ExecError;
use crate::scheduler::BatchScheduler;
use crate::workflow::directory::Directory;

/// Adapter for Slurm-managed clusters.
#[derive(Debug)]
pub struct SlurmScheduler {
    cpus_per_node: usize,
    gpus_per_node: usize,
}

impl SlurmScheduler {
    /// Conservative default when the node layout is not configured.
    pub const DEFAULT_CPUS: usize = 32;

    pub fn new(cpus_per_node: usize, gpus_per_node: usize) -> Self {
        Self {
            cpus_per_node,
            gpus_per_node,
        }
    }

    /// Renders the `#SBATCH` header of a submission script.
    fn header(&self, config: &JobConfig) -> Vec<String> {
        let hours = (config.walltime / 60.0) as u64;
        let minutes = (config.walltime - hours as f64 * 60.0).ceil() as u64;

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}", config.name),
            format!("#SBATCH -t {:02}:{:02}:00", hours, minutes),
            format!("#SBATCH --nodes={}", config.nnodes),
            "#SBATCH -o slurm.%J.o".to_string(),
            "#SBATCH -e slurm.%J.e".to_string(),
        ];

        if self.gpus_per_node > 0 {
            lines.push(format!("#SBATCH --gres=gpu:{}", self.gpus_per_node));
        }

        lines
    }
}

impl BatchScheduler for SlurmScheduler {
    fn cpus_per_node(&self) -> usize {
        self.cpus_per_node
    }

    fn gpus_per_node(&self) -> usize {
        self.gpus_per_node
    }

    fn mpiexec(
        &self,
        cmd: &str,
        nprocs: usize,
        cpus_per_proc: usize,
        gpus_per_proc: usize,
    ) -> String {
        let mut launch = format!("srun -n {} --cpus-per-task={}", nprocs, cpus_per_proc);
        if gpus_per_proc > 0 {
            launch.push_str(&format!(" --gpus-per-task={}", gpus_per_proc));
        }
        format!("{} {}", launch, cmd)
    }

    fn submit(&self, config: &JobConfig, dir: &Directory, cmd: &str) -> Result<(), ExecError> {
        let mut lines = self.header(config);
        lines.push(String::new());
        lines.push(cmd.to_string());
        lines.push(String::new());
        dir.write("job.bash", &lines.join("\n"))?;

        let status = Command::new("sbatch")
            .arg(dir.rel("job.bash"))
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failure(format!(
                "sbatch failed with exit code {:?}",
                status.code()
            )))
        }
    }

    fn requeue(&self) -> Result<(), ExecError> {
        let job_id = std::env::var("SLURM_JOB_ID")
            .map_err(|_| ExecError::Failure("SLURM_JOB_ID is not set".to_string()))?;

        let status = Command::new("scontrol")
            .arg("requeue")
            .arg(&job_id)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failure(format!(
                "scontrol requeue {} failed with exit code {:?}",
                job_id,
                status.code()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpiexec_cpu_only() {
        let slurm = SlurmScheduler::new(32, 0);
        assert_eq!(
            slurm.mpiexec("./solver", 8, 4, 0),
            "srun -n 8 --cpus-per-task=4 ./solver"
        );
    }

    #[test]
    fn test_mpiexec_with_gpus() {
        let slurm = SlurmScheduler::new(32, 4);
        assert_eq!(
            slurm.mpiexec("./solver", 4, 2, 1),
            "srun -n 4 --cpus-per-task=2 --gpus-per-task=1 ./solver"
        );
    }

    #[test]
    fn test_header_walltime_format() {
        let slurm = SlurmScheduler::new(32, 0);
        let config = JobConfig {
            name: "fwi".into(),
            nnodes: 16,
            walltime: 125.0,
            ..JobConfig::default()
        };

        let header = slurm.header(&config);
        assert!(header.contains(&"#SBATCH -t 02:05:00".to_string()));
        assert!(header.contains(&"#SBATCH --nodes=16".to_string()));
        assert!(!header.iter().any(|l| l.contains("gres")));
    }

    #[test]
    fn test_header_includes_gpus() {
        let slurm = SlurmScheduler::new(42, 6);
        let header = slurm.header(&JobConfig::default());
        assert!(header.contains(&"#SBATCH --gres=gpu:6".to_string()));
    }
}
