//! Legacy host process supervision.
//!
//! Launches the external host with the encoded environment, pumps its
//! combined stdout/stderr lines through the embedded-command classifier,
//! waits cancellably, and folds the exit code into the task result.
//!
//! The host's exit code is an error-count signal, not a success flag:
//! `0` leaves any result set by an embedded command standing, a positive
//! code means "N recoverable error records were surfaced" and fails the
//! task only when no result was set, and a negative code is an
//! infrastructure failure of the host itself that overrides everything.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::{CommandClassifier, ExecutionContext, TaskResult};
use crate::error::SupervisorError;

/// What the host's exit behavior amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    /// Whether a result had already been set (by an embedded command)
    /// before exit-code interpretation ran.
    pub result_already_set: bool,
}

/// Supervises one legacy host process per [`run`](Self::run) call; holds no
/// state across invocations beyond the classifier collaborator.
pub struct ProcessSupervisor {
    classifier: Arc<dyn CommandClassifier>,
}

impl ProcessSupervisor {
    pub fn new(classifier: Arc<dyn CommandClassifier>) -> Self {
        Self { classifier }
    }

    /// Runs the host to completion (or cancellation) and interprets its
    /// exit code. Spawn failures are fatal [`SupervisorError::Launch`]
    /// errors; everything after a successful launch is either forwarded
    /// output or result state.
    pub async fn run(
        &self,
        context: &ExecutionContext,
        executable: &Path,
        working_directory: &Path,
        environment: &BTreeMap<String, String>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        info!("launching legacy host {}", executable.display());
        let mut child = Command::new(executable)
            .current_dir(working_directory)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                executable: executable.to_path_buf(),
                source,
            })?;

        let Some(stdout) = child.stdout.take() else {
            return Err(SupervisorError::Io(io::Error::other("missing stdout pipe")));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(SupervisorError::Io(io::Error::other("missing stderr pipe")));
        };
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);

        // The line subscription lives exactly as long as this loop; every
        // exit path (EOF, I/O error, cancellation) releases it.
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line? {
                    Some(line) => self.offer_line(context, &line),
                    None => stdout_open = false,
                },
                line = stderr_lines.next_line(), if stderr_open => match line? {
                    Some(line) => self.offer_line(context, &line),
                    None => stderr_open = false,
                },
                _ = context.cancel.cancelled() => {
                    warn!("cancellation requested, killing legacy host");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(SupervisorError::Canceled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = context.cancel.cancelled() => {
                warn!("cancellation requested while waiting for host exit");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SupervisorError::Canceled);
            }
        };

        let exit_code = exit_code_of(&status);
        debug!("legacy host exited with code {exit_code}");
        Ok(apply_exit_code(context, exit_code))
    }

    fn offer_line(&self, context: &ExecutionContext, line: &str) {
        // Embedded commands are consumed by the classifier; anything else
        // is forwarded verbatim.
        if !self.classifier.try_process(context, line) {
            context.output(line);
        }
    }
}

/// A signal-terminated host reports no code; that is an infrastructure
/// failure of the host, same as a negative code.
fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Translates the host's exit code into task result state. Never raises —
/// exit codes are expected outcomes, not errors.
pub fn apply_exit_code(context: &ExecutionContext, exit_code: i32) -> ProcessOutcome {
    let result_already_set = context.result().is_some();
    if exit_code > 0 {
        if result_already_set {
            context.debug(&format!(
                "Task result already set. Not failing due to error count ({exit_code})."
            ));
        } else {
            context.set_result(TaskResult::Failed);
            context.error(&format!(
                "The script reported {exit_code} error record(s); failing the task."
            ));
        }
    } else if exit_code < 0 {
        context.set_result(TaskResult::Failed);
        context.error(&format!(
            "The legacy script host failed with return code {exit_code}."
        ));
    }
    ProcessOutcome {
        exit_code,
        result_already_set,
    }
}
