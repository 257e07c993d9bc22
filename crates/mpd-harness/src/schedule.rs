use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The delay elapsed and the action ran.
    Fired,
    /// Cancelled before the delay elapsed; the action never ran.
    Cancelled,
}

/// A one-shot action on its own thread, run after a delay unless cancelled.
///
/// [`ScheduledTask::cancel_and_join`] is the barrier before teardown: once it
/// returns, the action has either finished or will never start.
pub struct ScheduledTask {
    name: String,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<Result<TaskOutcome>>>,
}

impl ScheduledTask {
    pub fn spawn<F>(name: &str, delay: Duration, action: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let task_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("mpd-task-{name}"))
            .spawn(move || match cancel_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {
                    info!(task = %task_name, "scheduled task firing");
                    action()?;
                    Ok(TaskOutcome::Fired)
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!(task = %task_name, "scheduled task cancelled");
                    Ok(TaskOutcome::Cancelled)
                }
            })
            .with_context(|| format!("spawn task thread '{name}'"))?;

        Ok(Self {
            name: name.to_string(),
            cancel: Some(cancel_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Cancels the task if it has not fired yet, then waits for the thread.
    /// A running action is waited for, not interrupted.
    pub fn cancel_and_join(mut self) -> Result<TaskOutcome> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<TaskOutcome> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        let Some(handle) = self.handle.take() else {
            return Ok(TaskOutcome::Cancelled);
        };
        handle
            .join()
            .map_err(|_| anyhow!("task '{}' panicked", self.name))?
            .with_context(|| format!("task '{}'", self.name))
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        let _ = self.join_inner();
    }
}
