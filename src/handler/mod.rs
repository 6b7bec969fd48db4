//! Execution orchestrator for legacy scripts.
//!
//! Sequences one run end to end: validate the script and working directory,
//! stage the host runtime into the sandbox, encode the environment
//! protocol, supervise the host process, record the result. Errors before
//! the process launches are fatal to the run; supervisor failures after
//! launch become task result state instead, except launch failures, which
//! propagate.

pub mod variants;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::AgentLayout;
use crate::context::{CommandClassifier, ExecutionContext, TaskResult};
use crate::error::{HandlerError, StagingError, SupervisorError};
use crate::protocol::{self, EncodeRequest};
use crate::staging;
use crate::supervisor::ProcessSupervisor;

pub use self::variants::{ScriptVariant, SetupPolicy};

/// Lifecycle of one run. `Aborted` is reachable from any state on
/// cancellation or unrecovered error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    NotStarted,
    Validating,
    Staging,
    EnvironmentBuilt,
    ProcessRunning,
    Completed,
    Aborted,
}

/// Orchestrator for legacy script execution, parameterized by a
/// [`ScriptVariant`] capability record.
pub struct LegacyScriptHandler {
    layout: AgentLayout,
    supervisor: ProcessSupervisor,
    state: HandlerState,
}

impl LegacyScriptHandler {
    pub fn new(layout: AgentLayout, classifier: Arc<dyn CommandClassifier>) -> Self {
        Self {
            layout,
            supervisor: ProcessSupervisor::new(classifier),
            state: HandlerState::NotStarted,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Runs the variant's script through the legacy host and returns the
    /// final task result (`None` when nothing decided it).
    pub async fn run(
        &mut self,
        context: &ExecutionContext,
        inputs: &BTreeMap<String, String>,
        task_directory: &Path,
        variant: &ScriptVariant,
    ) -> Result<Option<TaskResult>, HandlerError> {
        match self
            .run_stages(context, inputs, task_directory, variant)
            .await
        {
            Ok(result) => {
                self.transition(HandlerState::Completed);
                Ok(result)
            }
            Err(err) => {
                self.transition(HandlerState::Aborted);
                Err(err)
            }
        }
    }

    async fn run_stages(
        &mut self,
        context: &ExecutionContext,
        inputs: &BTreeMap<String, String>,
        task_directory: &Path,
        variant: &ScriptVariant,
    ) -> Result<Option<TaskResult>, HandlerError> {
        self.transition(HandlerState::Validating);
        if !task_directory.is_dir() {
            return Err(StagingError::NotADirectory(task_directory.to_path_buf()).into());
        }
        let target = variant.target.trim();
        if target.is_empty() {
            return Err(HandlerError::Configuration(
                "script target is empty".to_string(),
            ));
        }
        let script_file = task_directory.join(target);
        if !script_file.is_file() {
            return Err(HandlerError::Configuration(format!(
                "script file not found: {}",
                script_file.display()
            )));
        }
        let working_directory = self.resolve_working_directory(variant, &script_file)?;
        debug!(
            "resolved script {} (working directory {})",
            script_file.display(),
            working_directory.display()
        );

        self.transition(HandlerState::Staging);
        context.output("Preparing legacy script host sandbox.");
        let source = self.layout.host_runtime_dir.clone();
        let sandbox = self.layout.sandbox_dir.clone();
        let cancel = context.cancel.clone();
        tokio::task::spawn_blocking(move || staging::copy_directory(&source, &sandbox, &cancel))
            .await
            .map_err(|err| HandlerError::Io(io::Error::other(err)))??;
        info!("finished staging host runtime binaries");

        let statements = variant.setup.build_statements(inputs, &self.layout)?;
        let environment = protocol::encode(
            context,
            &EncodeRequest {
                script_file: &script_file,
                working_directory: &working_directory,
                inputs,
                argument_format: &variant.argument_format,
                statements: &statements,
            },
        )?;
        self.transition(HandlerState::EnvironmentBuilt);

        self.transition(HandlerState::ProcessRunning);
        let host = self.layout.host_executable_path();
        match self
            .supervisor
            .run(context, &host, &working_directory, &environment)
            .await
        {
            Ok(outcome) => {
                debug!(
                    "host outcome: exit code {}, result already set: {}",
                    outcome.exit_code, outcome.result_already_set
                );
            }
            Err(err @ SupervisorError::Launch { .. }) => return Err(err.into()),
            Err(SupervisorError::Canceled) => {
                return Err(SupervisorError::Canceled.into());
            }
            Err(SupervisorError::Io(err)) => {
                // Post-launch stream failures become task state, like a
                // negative exit code.
                context.error(&format!("Legacy host output failure: {err}"));
                context.set_result(TaskResult::Failed);
            }
        }

        Ok(context.result())
    }

    fn resolve_working_directory(
        &self,
        variant: &ScriptVariant,
        script_file: &Path,
    ) -> Result<PathBuf, HandlerError> {
        if variant.working_directory.trim().is_empty() {
            return Ok(script_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")));
        }
        let dir = PathBuf::from(&variant.working_directory);
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    fn transition(&mut self, next: HandlerState) {
        debug!("handler state {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{MemorySink, NullClassifier};
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: AgentLayout,
        task_dir: PathBuf,
    }

    /// Lays out a runtime dir holding an executable fake host, an empty
    /// sandbox, externals, and a task directory with a script file.
    fn fixture(host_body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host_runtime_dir = dir.path().join("runtime");
        let sandbox_dir = dir.path().join("sandbox");
        let externals_dir = dir.path().join("externals");
        let task_dir = dir.path().join("task");
        fs::create_dir_all(&host_runtime_dir).unwrap();
        fs::create_dir_all(&externals_dir).unwrap();
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join("run.ps1"), b"Write-Output 'hi'\n").unwrap();

        let host = host_runtime_dir.join("legacy-script-host");
        fs::write(&host, format!("#!/bin/sh\n{host_body}\n")).unwrap();
        fs::set_permissions(&host, fs::Permissions::from_mode(0o755)).unwrap();

        Fixture {
            layout: AgentLayout {
                host_runtime_dir,
                sandbox_dir,
                externals_dir,
                host_executable: "legacy-script-host".to_string(),
            },
            task_dir,
            _dir: dir,
        }
    }

    fn handler(fixture: &Fixture) -> LegacyScriptHandler {
        LegacyScriptHandler::new(fixture.layout.clone(), Arc::new(NullClassifier))
    }

    fn context() -> (ExecutionContext, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (ExecutionContext::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_full_run_succeeds() {
        let fixture = fixture("echo \"running $LEGACYHOSTSCRIPTNAME\"\nexit 0");
        let mut handler = handler(&fixture);
        let (ctx, sink) = context();

        let result = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("run.ps1", "", ""),
            )
            .await
            .unwrap();

        assert_eq!(result, None); // exit 0 decides nothing
        assert_eq!(handler.state(), HandlerState::Completed);
        // The host was staged into the sandbox and actually ran.
        assert!(fixture.layout.sandbox_dir.join("legacy-script-host").exists());
        let lines = sink.output_lines();
        assert!(lines[0].contains("Preparing"));
        assert!(lines
            .iter()
            .any(|line| line.contains("running") && line.contains("run.ps1")));
    }

    #[tokio::test]
    async fn test_positive_exit_code_fails_task() {
        let fixture = fixture("exit 2");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let result = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("run.ps1", "", ""),
            )
            .await
            .unwrap();

        assert_eq!(result, Some(TaskResult::Failed));
        assert_eq!(handler.state(), HandlerState::Completed);
    }

    #[tokio::test]
    async fn test_missing_script_aborts() {
        let fixture = fixture("exit 0");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let err = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("absent.ps1", "", ""),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Configuration(_)));
        assert_eq!(handler.state(), HandlerState::Aborted);
        // No partial execution: the sandbox was never staged.
        assert!(!fixture.layout.sandbox_dir.exists());
    }

    #[tokio::test]
    async fn test_empty_target_aborts() {
        let fixture = fixture("exit 0");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let err = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("  ", "", ""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_task_directory_aborts() {
        let fixture = fixture("exit 0");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let err = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir.join("absent"),
                &ScriptVariant::plain("run.ps1", "", ""),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Staging(StagingError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_creates_missing_working_directory() {
        let fixture = fixture("pwd\nexit 0");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let workdir = fixture.task_dir.join("scratch/deep");
        handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("run.ps1", "", workdir.to_string_lossy()),
            )
            .await
            .unwrap();
        assert!(workdir.is_dir());
    }

    #[tokio::test]
    async fn test_cloud_variant_injects_statements() {
        let fixture = fixture("echo \"statements=$LEGACYHOSTSTATEMENTS\"\nexit 0");
        let mut handler = handler(&fixture);
        let (ctx, sink) = context();

        let inputs = BTreeMap::from([(
            "ConnectedServiceName".to_string(),
            "staging-env".to_string(),
        )]);
        handler
            .run(
                &ctx,
                &inputs,
                &fixture.task_dir,
                &ScriptVariant::cloud_deployment("run.ps1", "", ""),
            )
            .await
            .unwrap();

        assert!(sink.output_lines().iter().any(|line| {
            line.contains("Import-Module") && line.contains("staging-env")
        }));
    }

    #[tokio::test]
    async fn test_cloud_variant_without_connection_aborts() {
        let fixture = fixture("exit 0");
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let err = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::cloud_deployment("run.ps1", "", ""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Configuration(_)));
        assert_eq!(handler.state(), HandlerState::Aborted);
    }

    #[tokio::test]
    async fn test_missing_host_executable_is_fatal() {
        let fixture = fixture("exit 0");
        // Remove the host so staging copies nothing useful.
        fs::remove_file(fixture.layout.host_runtime_dir.join("legacy-script-host")).unwrap();
        let mut handler = handler(&fixture);
        let (ctx, _) = context();

        let err = handler
            .run(
                &ctx,
                &BTreeMap::new(),
                &fixture.task_dir,
                &ScriptVariant::plain("run.ps1", "", ""),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Supervisor(SupervisorError::Launch { .. })
        ));
        assert_eq!(handler.state(), HandlerState::Aborted);
    }
}
