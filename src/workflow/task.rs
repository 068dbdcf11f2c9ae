//! Task: Leaf Work Unit
//!
//! A `Task` wraps one callable: either a plain function or one that produces
//! a future (a subprocess launch, a dispatcher call). The two variants are an
//! explicit tagged union; the engine dispatches on the tag rather than
//! probing return values at runtime.
//!
//! Errors raised by the callable are captured as data on the task, never
//! re-raised to the caller. The enclosing workspace inspects them to decide
//! whether to continue.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;

use crate::error::ExecError;
use crate::workflow::node::{ParentRef, State};

/// The callable wrapped by a task.
#[derive(Clone)]
pub enum Action {
    /// A synchronous function.
    Sync(Rc<dyn Fn() -> Result<(), ExecError>>),
    /// A function producing a future, awaited on the engine's event loop.
    Async(Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), ExecError>>>),
}

impl Action {
    /// Wraps a synchronous function.
    pub fn sync(f: impl Fn() -> Result<(), ExecError> + 'static) -> Self {
        Action::Sync(Rc::new(f))
    }

    /// Wraps a future-producing function.
    pub fn asynchronous(
        f: impl Fn() -> LocalBoxFuture<'static, Result<(), ExecError>> + 'static,
    ) -> Self {
        Action::Async(Rc::new(f))
    }

    /// Runs the action to completion.
    pub async fn call(&self) -> Result<(), ExecError> {
        match self {
            Action::Sync(f) => f(),
            Action::Async(f) => f().await,
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Sync(_) => f.write_str("Action::Sync"),
            Action::Async(_) => f.write_str("Action::Async"),
        }
    }
}

/// Progress reported by a task's prober while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Completed fraction in `0.0..=1.0`.
    Fraction(f64),
    /// Free-form status text.
    Text(String),
}

/// A leaf node wrapping one callable.
pub struct Task {
    name: String,
    action: Action,
    prober: Option<Rc<dyn Fn() -> Option<Progress>>>,
    parent: ParentRef,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    error: Option<ExecError>,
}

impl Task {
    /// Creates a task wrapping `action`.
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            action,
            prober: None,
            parent: ParentRef::new(),
            started: None,
            ended: None,
            error: None,
        }
    }

    /// Attaches a progress prober consulted while the task runs.
    pub fn with_prober(mut self, prober: impl Fn() -> Option<Progress> + 'static) -> Self {
        self.prober = Some(Rc::new(prober));
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped callable.
    pub fn action(&self) -> Action {
        self.action.clone()
    }

    pub fn parent(&self) -> &ParentRef {
        &self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: ParentRef) {
        self.parent = parent;
    }

    /// When the callable was invoked.
    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    /// When the callable returned successfully.
    pub fn ended(&self) -> Option<DateTime<Utc>> {
        self.ended
    }

    /// The captured error, if any.
    pub fn error(&self) -> Option<&ExecError> {
        self.error.as_ref()
    }

    /// Clears execution state back to `Idle`.
    pub fn reset(&mut self) {
        self.started = None;
        self.ended = None;
        self.error = None;
    }

    /// Records the start of an attempt, wiping any previous one.
    pub fn begin(&mut self) {
        self.reset();
        self.started = Some(Utc::now());
    }

    /// Records a successful completion.
    pub fn succeed(&mut self) {
        self.ended = Some(Utc::now());
    }

    /// Captures the error that ended this attempt.
    pub fn fail(&mut self, error: ExecError) {
        self.error = Some(error);
    }

    /// Restores recorded progress from a checkpoint.
    pub(crate) fn restore(
        &mut self,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
        error: Option<ExecError>,
    ) {
        self.started = started;
        self.ended = ended;
        self.error = error;
    }

    /// Derived execution state.
    pub fn state(&self) -> State {
        match (&self.started, &self.ended, &self.error) {
            (_, _, Some(e)) if e.is_fatal() => State::Failed,
            (_, _, Some(_)) => State::Paused,
            (Some(_), Some(_), None) => State::Done,
            (Some(_), None, None) => State::Running,
            _ => State::Idle,
        }
    }

    /// State rendered for display. A running task with a prober reports its
    /// probed progress instead; prober output outside `0..=1` is ignored.
    pub fn state_label(&self) -> String {
        if self.state() == State::Running {
            if let Some(prober) = &self.prober {
                match prober() {
                    Some(Progress::Fraction(p)) if (0.0..=1.0).contains(&p) => {
                        return format!("{}%", (p * 100.0) as u32);
                    }
                    Some(Progress::Text(text)) => return text,
                    _ => {}
                }
            }
        }
        self.state().to_string()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_wipes_previous_attempt() {
        let mut task = Task::new("t", Action::sync(|| Ok(())));
        task.begin();
        task.fail(ExecError::Failure("boom".into()));
        assert_eq!(task.state(), State::Failed);

        task.begin();
        assert_eq!(task.state(), State::Running);
        assert!(task.error().is_none());
        assert!(task.ended().is_none());
    }

    #[tokio::test]
    async fn test_sync_action_call() {
        let action = Action::sync(|| Err(ExecError::Failure("nope".into())));
        assert!(action.call().await.is_err());
    }

    #[tokio::test]
    async fn test_async_action_call() {
        let action = Action::asynchronous(|| Box::pin(async { Ok(()) }));
        assert!(action.call().await.is_ok());
    }

    #[test]
    fn test_progress_label_fraction() {
        let mut task =
            Task::new("t", Action::sync(|| Ok(()))).with_prober(|| Some(Progress::Fraction(0.42)));
        task.begin();
        assert_eq!(task.state_label(), "42%");
    }

    #[test]
    fn test_progress_label_text() {
        let mut task = Task::new("t", Action::sync(|| Ok(())))
            .with_prober(|| Some(Progress::Text("iteration 3".into())));
        task.begin();
        assert_eq!(task.state_label(), "iteration 3");
    }

    #[test]
    fn test_progress_ignored_when_not_running() {
        let task =
            Task::new("t", Action::sync(|| Ok(()))).with_prober(|| Some(Progress::Fraction(0.9)));
        assert_eq!(task.state_label(), "idle");
    }

    #[test]
    fn test_out_of_range_fraction_falls_back() {
        let mut task =
            Task::new("t", Action::sync(|| Ok(()))).with_prober(|| Some(Progress::Fraction(1.5)));
        task.begin();
        assert_eq!(task.state_label(), "running");
    }
}
