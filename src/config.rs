//! Job Configuration
//!
//! The configuration surface of one batch job: the granted allocation
//! (node count, walltime), the requeue opt-in, cluster identity, named
//! walltime budgets, and the global `[workspace]` parameter table that ends
//! the workspace attribute-resolution chain.
//!
//! Loading from a file is the caller's concern; the type deserializes from
//! YAML and accepts `section.key=value` overrides applied at submission
//! time, coerced against the field's existing type.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecError;

/// Configuration of a single batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job name used for the root workspace and submission scripts.
    pub name: String,

    /// Total nodes granted to the allocation; the dispatcher's budget.
    pub nnodes: usize,

    /// Job walltime in minutes.
    pub walltime: f64,

    /// Whether a cleanly stopped job may be handed back to the batch
    /// scheduler for requeueing.
    pub requeue: bool,

    /// Cluster identifier selecting the scheduler adapter.
    pub cluster: Option<String>,

    /// Override of the adapter's CPUs-per-node constant.
    pub cpus_per_node: Option<usize>,

    /// Override of the adapter's GPUs-per-node constant.
    pub gpus_per_node: Option<usize>,

    /// Named walltime budgets in minutes, keyed by task name.
    pub walltimes: HashMap<String, f64>,

    /// Global fallback values for workspace attribute resolution.
    pub workspace: HashMap<String, Value>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: "job".to_string(),
            nnodes: 1,
            walltime: 60.0,
            requeue: false,
            cluster: None,
            cpus_per_node: None,
            gpus_per_node: None,
            walltimes: HashMap::new(),
            workspace: HashMap::new(),
        }
    }
}

impl JobConfig {
    /// Loads a configuration from a YAML file.
    pub fn from_yaml(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Applies one `section.key=value` override.
    ///
    /// Known sections are `job` (scalar fields), `walltime` (named budgets)
    /// and `workspace` (free-form values). Values for `job` fields are
    /// coerced against the field's type; a mismatch is an error rather than
    /// a silent string assignment.
    pub fn apply_override(&mut self, spec: &str) -> Result<(), ExecError> {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| ExecError::Failure(format!("override '{}' is not key=value", spec)))?;
        let (section, key) = key
            .split_once('.')
            .ok_or_else(|| ExecError::Failure(format!("override '{}' is not section.key", spec)))?;

        match section {
            "job" => self.apply_job_override(key, value),
            "walltime" => {
                let minutes = value.parse::<f64>().map_err(|_| {
                    ExecError::Failure(format!("walltime.{} expects minutes, got '{}'", key, value))
                })?;
                self.walltimes.insert(key.to_string(), minutes);
                Ok(())
            }
            "workspace" => {
                let parsed =
                    serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::from(value));
                self.workspace.insert(key.to_string(), parsed);
                Ok(())
            }
            other => Err(ExecError::Failure(format!(
                "unknown config section '{}'",
                other
            ))),
        }
    }

    fn apply_job_override(&mut self, key: &str, value: &str) -> Result<(), ExecError> {
        let type_error = |expected: &str| {
            ExecError::Failure(format!("job.{} expects {}, got '{}'", key, expected, value))
        };

        match key {
            "name" => self.name = value.to_string(),
            "cluster" => self.cluster = Some(value.to_string()),
            "nnodes" => self.nnodes = value.parse().map_err(|_| type_error("an integer"))?,
            "walltime" => self.walltime = value.parse().map_err(|_| type_error("minutes"))?,
            "requeue" => {
                self.requeue = match value {
                    "true" => true,
                    "false" => false,
                    _ => return Err(type_error("a boolean")),
                }
            }
            "cpus_per_node" => {
                self.cpus_per_node = Some(value.parse().map_err(|_| type_error("an integer"))?)
            }
            "gpus_per_node" => {
                self.gpus_per_node = Some(value.parse().map_err(|_| type_error("an integer"))?)
            }
            other => {
                return Err(ExecError::Failure(format!(
                    "unknown config entry 'job.{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.nnodes, 1);
        assert!(!config.requeue);
        assert!(config.walltimes.is_empty());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = "
name: fwi_run
nnodes: 16
walltime: 720
requeue: true
cluster: slurm
walltimes:
  forward: 15
  adjoint: 20
workspace:
  iterations: 5
";
        let config: JobConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "fwi_run");
        assert_eq!(config.nnodes, 16);
        assert_eq!(config.walltimes["adjoint"], 20.0);
        assert_eq!(config.workspace["iterations"], Value::from(5));
    }

    #[test]
    fn test_override_job_fields() {
        let mut config = JobConfig::default();
        config.apply_override("job.nnodes=8").unwrap();
        config.apply_override("job.requeue=true").unwrap();
        config.apply_override("job.walltime=120.5").unwrap();
        assert_eq!(config.nnodes, 8);
        assert!(config.requeue);
        assert_eq!(config.walltime, 120.5);
    }

    #[test]
    fn test_override_type_mismatch() {
        let mut config = JobConfig::default();
        assert!(config.apply_override("job.nnodes=lots").is_err());
        assert!(config.apply_override("job.requeue=yes").is_err());
    }

    #[test]
    fn test_override_walltime_and_workspace() {
        let mut config = JobConfig::default();
        config.apply_override("walltime.forward=12").unwrap();
        config.apply_override("workspace.period=17.5").unwrap();
        config.apply_override("workspace.tag=smooth").unwrap();

        assert_eq!(config.walltimes["forward"], 12.0);
        assert_eq!(config.workspace["period"], Value::from(17.5));
        assert_eq!(config.workspace["tag"], Value::from("smooth"));
    }

    #[test]
    fn test_override_rejects_malformed() {
        let mut config = JobConfig::default();
        assert!(config.apply_override("nnodes=8").is_err());
        assert!(config.apply_override("job.nnodes").is_err());
        assert!(config.apply_override("cluster.name=x").is_err());
    }
}
