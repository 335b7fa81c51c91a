//! Running task payloads on followers
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Command;

use peerd_api::TaskOutcome;
use tracing::{debug, warn};

/// Turns a task payload into an outcome
///
/// Payloads are opaque to the coordination layer, only the executor
/// gives them meaning. Failures are outcomes too: implementations
/// should report them through [`TaskOutcome::Failure`].
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: &[u8]) -> TaskOutcome;
}

impl<F> Executor for F
where
    F: Fn(&[u8]) -> TaskOutcome + Send + Sync + 'static,
{
    fn execute(&self, task: &[u8]) -> TaskOutcome {
        self(task)
    }
}

/// Runs the payload as a script with `<shell> -c <payload>`
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SHELL)
    }
}

impl ShellExecutor {
    pub const DEFAULT_SHELL: &'static str = "/bin/sh";

    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Executor for ShellExecutor {
    fn execute(&self, task: &[u8]) -> TaskOutcome {
        let script = match std::str::from_utf8(task) {
            Ok(script) => script,
            Err(e) => return TaskOutcome::failure(format!("task is not valid UTF-8: {e}")),
        };

        debug!(shell = %self.shell.display(), script, "Running task");
        let output = match Command::new(&self.shell).arg("-c").arg(script).output() {
            Ok(output) => output,
            Err(e) => {
                return TaskOutcome::failure(format!(
                    "could not run {}: {e}",
                    self.shell.display()
                ))
            }
        };

        if output.status.success() {
            TaskOutcome::success(output.stdout)
        } else {
            TaskOutcome::failure(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            ))
        }
    }
}

/// Execute a task, turning a panicking executor into a failed outcome
pub(crate) fn execute_guarded(executor: &dyn Executor, task: &[u8]) -> TaskOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(task))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(panic = %msg, "Executor panicked");
            TaskOutcome::failure(format!("executor panicked: {msg}"))
        }
    }
}
