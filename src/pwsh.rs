// ABOUTME: Default scripting engine running each command in a sandboxed pwsh subprocess
// ABOUTME: Streams output lines as engine events; abort kills the child; no debugger support
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Subprocess Engine
//!
//! [`PwshEngine`] keeps no interpreter state between commands: every
//! [`ExecutionRequest`] starts `pwsh -NoProfile -NonInteractive -Command`
//! in the sandboxed working directory. That is enough for completion, help
//! lookups, module discovery, analysis and running scripts to completion.
//! Breakpoints and stepping need an in-process runspace, so every debugger
//! operation reports [`EngineErrorKind::Unsupported`](crate::engine::EngineErrorKind).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::discovery::discover_pwsh;
use crate::engine::{
    BreakpointInfo, CommandBreakpoint, EngineError, EngineEvent, EngineEvents, EngineStatus,
    ExecutionOutput, ExecutionRequest, LineBreakpoint, OutputCategory, ResumeAction, RunspaceInfo,
    RunspaceKind, ScopeInfo, ScriptingEngine, StackFrameInfo, VariableInfo,
};
use crate::process::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::{apply_sandbox, build_policy, SandboxPolicy};
use crate::types::BridgeError;

/// Quote a string as a single-quoted PowerShell literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Script text that invokes a script file with arguments
fn invocation_text(request: &ExecutionRequest) -> String {
    match &request.script {
        Some(path) => {
            let mut text = format!("& {}", quote_literal(&path.to_string_lossy()));
            for arg in &request.arguments {
                text.push(' ');
                text.push_str(arg);
            }
            text
        }
        None => request.command.clone(),
    }
}

/// Engine backed by one `pwsh` process per command
pub struct PwshEngine {
    binary: PathBuf,
    policy: SandboxPolicy,
    command_timeout: Duration,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<EngineEvents>>,
    status: Mutex<EngineStatus>,
    running: Mutex<Option<CancellationToken>>,
}

impl PwshEngine {
    /// Engine using an explicit binary and sandbox
    pub fn new(binary: PathBuf, policy: SandboxPolicy, command_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(EngineEvent::RunspaceChanged(RunspaceInfo {
            name: "Local".to_owned(),
            kind: RunspaceKind::Local,
            computer_name: None,
            process_id: None,
        }));
        Self {
            binary,
            policy,
            command_timeout,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            status: Mutex::new(EngineStatus::Idle),
            running: Mutex::new(None),
        }
    }

    /// Discover `pwsh` and build the sandbox from configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let binary = discover_pwsh(config.pwsh_path.as_deref())?;
        let policy = build_policy(config.working_directory.as_deref(), &config.allowed_env_keys)
            .map_err(|e| BridgeError::config(format!("Cannot resolve working directory: {e}")))?;
        info!(binary = %binary.display(), cwd = %policy.working_directory.display(), "Using pwsh engine");
        Ok(Self::new(binary, policy, config.command_timeout))
    }

    /// Binary this engine runs
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Sandbox applied to every command
    pub const fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    fn status_slot(&self) -> MutexGuard<'_, EngineStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, category: OutputCategory, line: &str) {
        let _ = self.events_tx.send(EngineEvent::OutputWritten {
            category,
            text: format!("{line}\n"),
        });
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        abort: CancellationToken,
    ) -> Result<ExecutionOutput, EngineError> {
        let text = invocation_text(request);
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "-NoLogo",
            "-NoProfile",
            "-NonInteractive",
            "-OutputFormat",
            "Text",
            "-Command",
            text.as_str(),
        ]);
        apply_sandbox(&mut cmd, &self.policy);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::unusable(format!("Failed to start {}: {e}", self.binary.display()))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::fault("pwsh stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::fault("pwsh stderr not captured"))?;

        let mut out_lines = LinesStream::new(BufReader::new(stdout).lines());
        let mut err_lines = LinesStream::new(BufReader::new(stderr).lines());
        let (mut out_done, mut err_done) = (false, false);
        let mut output = ExecutionOutput::default();
        let mut captured_bytes = 0usize;
        let mut errors = Vec::new();

        let deadline = tokio::time::sleep(self.command_timeout);
        tokio::pin!(deadline);

        while !(out_done && err_done) {
            tokio::select! {
                () = abort.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EngineError::aborted("The pipeline has been stopped"));
                }
                () = &mut deadline => {
                    warn!(timeout = ?self.command_timeout, command = request.label(), "Engine command timed out");
                    let _ = child.kill().await;
                    return Err(EngineError::timeout(format!(
                        "Command did not finish within {:?}",
                        self.command_timeout
                    )));
                }
                line = out_lines.next(), if !out_done => match line {
                    Some(Ok(line)) => {
                        if request.write_output {
                            self.emit(OutputCategory::Stdout, &line);
                        }
                        captured_bytes += line.len();
                        if captured_bytes <= DEFAULT_MAX_OUTPUT_BYTES {
                            output.lines.push(line);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "pwsh stdout read failed");
                        out_done = true;
                    }
                    None => out_done = true,
                },
                line = err_lines.next(), if !err_done => match line {
                    Some(Ok(line)) => {
                        output.had_errors = true;
                        if request.write_output {
                            self.emit(OutputCategory::Stderr, &line);
                        }
                        errors.push(line);
                    }
                    Some(Err(_)) | None => err_done = true,
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::fault(format!("Failed to wait for pwsh: {e}")))?;
        match status.code() {
            Some(0) => Ok(output),
            code => {
                let detail = errors.last().cloned().unwrap_or_else(|| {
                    code.map_or_else(
                        || "pwsh was terminated by a signal".to_owned(),
                        |c| format!("pwsh exited with code {c}"),
                    )
                });
                Err(EngineError::fault(detail))
            }
        }
    }
}

#[async_trait]
impl ScriptingEngine for PwshEngine {
    fn name(&self) -> &str {
        "pwsh"
    }

    fn subscribe(&self) -> Result<EngineEvents, EngineError> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EngineError::fault("Engine events already subscribed"))
    }

    fn status(&self) -> EngineStatus {
        *self.status_slot()
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, EngineError> {
        if request.stop_on_entry {
            debug!("stop_on_entry ignored: pwsh engine has no debugger");
        }
        let abort = CancellationToken::new();
        *self.running_slot() = Some(abort.clone());
        *self.status_slot() = EngineStatus::Busy;

        debug!(command = request.label(), "Running pwsh command");
        let result = self.run(&request, abort).await;

        *self.running_slot() = None;
        *self.status_slot() = match &result {
            Err(e) if e.is_unusable() => EngineStatus::Unusable,
            _ => EngineStatus::Idle,
        };
        result
    }

    async fn abort(&self) -> Result<(), EngineError> {
        if let Some(token) = self.running_slot().take() {
            info!("Aborting running pwsh command");
            token.cancel();
        }
        Ok(())
    }

    async fn break_execution(&self) -> Result<(), EngineError> {
        Err(EngineError::unsupported("Pausing"))
    }

    async fn resume(&self, _action: ResumeAction) -> Result<(), EngineError> {
        Err(EngineError::unsupported("Stepping"))
    }

    async fn set_line_breakpoints(
        &self,
        _script: &Path,
        _breakpoints: &[LineBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError> {
        Err(EngineError::unsupported("Line breakpoints"))
    }

    async fn set_command_breakpoints(
        &self,
        _breakpoints: &[CommandBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError> {
        Err(EngineError::unsupported("Command breakpoints"))
    }

    async fn stack_trace(&self) -> Result<Vec<StackFrameInfo>, EngineError> {
        Err(EngineError::unsupported("Stack inspection"))
    }

    async fn scopes(&self, _frame_id: i64) -> Result<Vec<ScopeInfo>, EngineError> {
        Err(EngineError::unsupported("Scope inspection"))
    }

    async fn variables(&self, _reference: i64) -> Result<Vec<VariableInfo>, EngineError> {
        Err(EngineError::unsupported("Variable inspection"))
    }

    async fn set_variable(
        &self,
        _reference: i64,
        _name: &str,
        _value: &str,
    ) -> Result<VariableInfo, EngineError> {
        Err(EngineError::unsupported("Setting variables"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineErrorKind;

    fn engine_with(binary: &str) -> PwshEngine {
        PwshEngine::new(
            PathBuf::from(binary),
            SandboxPolicy::new(std::env::temp_dir()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn literals_escape_single_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn script_requests_invoke_the_file_with_arguments() {
        let request = ExecutionRequest::script("/tmp/my script.ps1", vec!["-Name".to_owned(), "x".to_owned()]);
        assert_eq!(invocation_text(&request), "& '/tmp/my script.ps1' -Name x");
    }

    #[test]
    fn announces_local_runspace_on_subscribe() {
        let engine = engine_with("/nonexistent/pwsh");
        let mut events = engine.subscribe().expect("subscribe");
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::RunspaceChanged(RunspaceInfo { kind: RunspaceKind::Local, .. }))
        ));
        assert!(engine.subscribe().is_err());
    }

    #[tokio::test]
    async fn missing_binary_makes_engine_unusable() {
        let engine = engine_with("/nonexistent/pwsh");
        let err = engine
            .execute(ExecutionRequest::command("Get-Date"))
            .await
            .expect_err("no binary");
        assert!(err.is_unusable());
        assert_eq!(engine.status(), EngineStatus::Unusable);
    }

    #[tokio::test]
    async fn debugger_operations_are_unsupported() {
        let engine = engine_with("/nonexistent/pwsh");
        let err = engine
            .set_line_breakpoints(Path::new("/tmp/a.ps1"), &[])
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind, EngineErrorKind::Unsupported);
        assert!(engine.abort().await.is_ok());
    }
}
