//! Remote Entry Bootstrap
//!
//! A distributed launch cannot ship a closure to another process. Instead
//! the embedding application registers named entry points in a
//! [`TaskRegistry`] at startup, the dispatcher writes the entry's name to a
//! `<fid>.task` side file and re-invokes the current executable with
//! `--remote <dir>:<fid>`. The remote process looks the name up and runs
//! it; failures and panics are written to `<fid>.error`, the out-of-band
//! channel the launching side inspects after the subprocess exits.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use log::{error, info};

use crate::error::ExecError;
use crate::workflow::directory::Directory;
use crate::workflow::task::Action;

/// Named entry points runnable from a `--remote` invocation.
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<String, Action>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry point under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, action: Action) {
        self.entries.insert(name.into(), action);
    }

    /// Registers a synchronous function.
    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        f: impl Fn() -> Result<(), ExecError> + 'static,
    ) {
        self.register(name, Action::sync(f));
    }

    /// Registers a future-producing function.
    pub fn register_async(
        &mut self,
        name: impl Into<String>,
        f: impl Fn() -> LocalBoxFuture<'static, Result<(), ExecError>> + 'static,
    ) {
        self.register(name, Action::asynchronous(f));
    }

    /// Looks up an entry point by name.
    pub fn get(&self, name: &str) -> Option<Action> {
        self.entries.get(name).cloned()
    }
}

/// Runs one registered entry in a `--remote <dir>:<fid>` invocation.
///
/// Any failure, including a panic inside the entry, lands in `<fid>.error`
/// so the launching process can classify the run even when the exit code
/// is unreliable across the scheduler's launcher.
pub async fn run_remote(registry: &TaskRegistry, spec: &str) -> Result<(), ExecError> {
    let (dir, fid) = spec
        .rsplit_once(':')
        .ok_or_else(|| ExecError::Failure(format!("remote spec '{}' is not dir:fid", spec)))?;
    let dir = Directory::new(dir);

    let result = run_entry(registry, &dir, fid).await;
    if let Err(e) = &result {
        error!("remote task {} failed: {}", fid, e);
        if let Err(write_err) = dir.write(format!("{}.error", fid), &e.to_string()) {
            error!("could not write {}.error: {}", fid, write_err);
        }
    }
    result
}

async fn run_entry(
    registry: &TaskRegistry,
    dir: &Directory,
    fid: &str,
) -> Result<(), ExecError> {
    let name = dir.read(format!("{}.task", fid))?;
    let name = name.trim();
    let action = registry
        .get(name)
        .ok_or_else(|| ExecError::Failure(format!("no registered task '{}'", name)))?;

    info!("remote task: {}", name);
    match AssertUnwindSafe(action.call()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ExecError::Failure(format!(
            "task '{}' panicked: {}",
            name,
            panic_text(panic.as_ref())
        ))),
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn spec_for(dir: &Directory, fid: &str) -> String {
        format!("{}:{}", dir.path().display(), fid)
    }

    #[tokio::test]
    async fn test_runs_registered_entry() {
        let tmp = tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        dir.write("mpiexec.forward.task", "forward").unwrap();

        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let mut registry = TaskRegistry::new();
        registry.register_fn("forward", move || {
            flag.set(true);
            Ok(())
        });

        run_remote(&registry, &spec_for(&dir, "mpiexec.forward"))
            .await
            .unwrap();
        assert!(ran.get());
        assert!(!dir.has("mpiexec.forward.error"));
    }

    #[tokio::test]
    async fn test_failure_writes_sidecar() {
        let tmp = tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        dir.write("mpiexec.adjoint.task", "adjoint").unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_async("adjoint", || {
            Box::pin(async { Err(ExecError::Failure("rank 2 diverged".into())) })
        });

        let err = run_remote(&registry, &spec_for(&dir, "mpiexec.adjoint"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        let sidecar = dir.read("mpiexec.adjoint.error").unwrap();
        assert!(sidecar.contains("rank 2 diverged"));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let tmp = tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        dir.write("mpiexec.solve.task", "solve").unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_fn("solve", || panic!("index out of bounds"));

        let err = run_remote(&registry, &spec_for(&dir, "mpiexec.solve"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index out of bounds"));
        assert!(dir.has("mpiexec.solve.error"));
    }

    #[tokio::test]
    async fn test_unknown_entry_reports_through_sidecar() {
        let tmp = tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        dir.write("mpiexec.mystery.task", "mystery").unwrap();

        let registry = TaskRegistry::new();
        let err = run_remote(&registry, &spec_for(&dir, "mpiexec.mystery"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no registered task"));
        assert!(dir.has("mpiexec.mystery.error"));
    }

    #[tokio::test]
    async fn test_malformed_spec() {
        let registry = TaskRegistry::new();
        assert!(run_remote(&registry, "no-separator").await.is_err());
    }
}
