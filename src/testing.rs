// ABOUTME: Scripted engine, static analyzer, and recording fault sink for exercising the bridge
// ABOUTME: Compiled for unit tests and for endpoint crates via the `testing` feature
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! In-process fakes for the collaborator traits.
//!
//! [`ScriptedEngine`] runs canned step lists keyed by command text. A
//! [`Step::Stop`] suspends the command in a simulated nested prompt until
//! [`ScriptingEngine::resume`] or [`ScriptingEngine::abort`] is called, and
//! commands executed while suspended run immediately, the way a real nested
//! prompt behaves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::analysis::{Analyzer, DiagnosticMarker, FormatOptions, MarkerSeverity};
use crate::dispatcher::{Fault, FaultSink};
use crate::engine::{
    BreakpointChange, BreakpointInfo, CommandBreakpoint, EngineError, EngineEvent, EngineEvents,
    EngineStatus, ExecutionOutput, ExecutionRequest, LineBreakpoint, OutputCategory, ResumeAction,
    ScopeInfo, ScriptingEngine, StackFrameInfo, StopDetails, VariableInfo,
};
use crate::types::BridgeError;
use crate::workspace::ScriptFile;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Scripted Engine
// ============================================================================

/// One step of a canned command
#[derive(Debug, Clone)]
pub enum Step {
    /// Write output to the host
    Output(OutputCategory, String),
    /// Append result lines
    Return(Vec<String>),
    /// Stop in the debugger until resumed
    Stop(StopDetails),
    /// Take some time, abortable
    Delay(Duration),
    /// Never finish unless aborted
    Hang,
    /// Fail with an engine error
    Fail(EngineError),
}

struct Shared {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<EngineEvents>>,
    status: Mutex<EngineStatus>,
    executed: Mutex<Vec<ExecutionRequest>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    resume_tx: watch::Sender<u64>,
    abort_tx: watch::Sender<u64>,
    ignore_aborts: AtomicBool,
    aborts: AtomicUsize,
    pauses: AtomicUsize,
    resumes: Mutex<Vec<ResumeAction>>,
    breakpoint_failure: Mutex<Option<EngineError>>,
    breakpoint_calls: AtomicUsize,
    next_breakpoint_id: AtomicI64,
    current_script: Mutex<Option<PathBuf>>,
    variables: Mutex<Vec<VariableInfo>>,
}

/// Engine that plays back canned step lists
#[derive(Clone)]
pub struct ScriptedEngine {
    shared: Arc<Shared>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Engine where every command succeeds with no output
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (resume_tx, _) = watch::channel(0);
        let (abort_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                status: Mutex::new(EngineStatus::Idle),
                executed: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                resume_tx,
                abort_tx,
                ignore_aborts: AtomicBool::new(false),
                aborts: AtomicUsize::new(0),
                pauses: AtomicUsize::new(0),
                resumes: Mutex::new(Vec::new()),
                breakpoint_failure: Mutex::new(None),
                breakpoint_calls: AtomicUsize::new(0),
                next_breakpoint_id: AtomicI64::new(1),
                current_script: Mutex::new(None),
                variables: Mutex::new(vec![VariableInfo {
                    name: "$x".to_owned(),
                    value: "42".to_owned(),
                    type_name: Some("System.Int32".to_owned()),
                    variables_reference: 0,
                }]),
            }),
        }
    }

    /// Register the steps played for an exact command text
    #[must_use]
    pub fn with_script(self, command: &str, steps: Vec<Step>) -> Self {
        lock(&self.shared.scripts).insert(command.to_owned(), steps);
        self
    }

    /// Make every set-breakpoints call fail with `error`
    pub fn fail_breakpoints(&self, error: EngineError) {
        *lock(&self.shared.breakpoint_failure) = Some(error);
    }

    /// Make abort a no-op, leaving running commands hung
    pub fn ignore_aborts(&self) {
        self.shared.ignore_aborts.store(true, Ordering::SeqCst);
    }

    /// Raise an engine event out of band
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    /// Command texts executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.shared.executed)
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    /// Full requests executed so far
    pub fn executed_requests(&self) -> Vec<ExecutionRequest> {
        lock(&self.shared.executed).clone()
    }

    /// Highest number of top-level commands ever running at once
    pub fn max_concurrency(&self) -> usize {
        self.shared.max_running.load(Ordering::SeqCst)
    }

    /// Number of abort calls
    pub fn abort_count(&self) -> usize {
        self.shared.aborts.load(Ordering::SeqCst)
    }

    /// Number of break calls
    pub fn pause_count(&self) -> usize {
        self.shared.pauses.load(Ordering::SeqCst)
    }

    /// Resume actions received, in order
    pub fn resumes(&self) -> Vec<ResumeAction> {
        lock(&self.shared.resumes).clone()
    }

    /// Number of set-breakpoints calls that reached the engine
    pub fn breakpoint_calls(&self) -> usize {
        self.shared.breakpoint_calls.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: EngineStatus) {
        *lock(&self.shared.status) = status;
    }

    async fn play(
        &self,
        steps: Vec<Step>,
        abort_rx: &mut watch::Receiver<u64>,
    ) -> Result<ExecutionOutput, EngineError> {
        let mut output = ExecutionOutput::default();
        for step in steps {
            match step {
                Step::Output(category, text) => {
                    if category == OutputCategory::Stderr {
                        output.had_errors = true;
                    }
                    self.emit(EngineEvent::OutputWritten { category, text });
                }
                Step::Return(lines) => output.lines.extend(lines),
                Step::Stop(details) => {
                    let mut resume_rx = self.shared.resume_tx.subscribe();
                    self.set_status(EngineStatus::Stopped);
                    self.emit(EngineEvent::DebuggerStopped(details));
                    tokio::select! {
                        Ok(()) = resume_rx.changed() => self.set_status(EngineStatus::Busy),
                        Ok(()) = abort_rx.changed() => {
                            return Err(EngineError::aborted("Pipeline stopped"));
                        }
                    }
                }
                Step::Delay(duration) => {
                    tokio::select! {
                        () = tokio::time::sleep(duration) => {}
                        Ok(()) = abort_rx.changed() => {
                            return Err(EngineError::aborted("Pipeline stopped"));
                        }
                    }
                }
                Step::Hang => {
                    if abort_rx.changed().await.is_ok() {
                        return Err(EngineError::aborted("Pipeline stopped"));
                    }
                    std::future::pending::<()>().await;
                }
                Step::Fail(error) => return Err(error),
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl ScriptingEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn subscribe(&self) -> Result<EngineEvents, EngineError> {
        lock(&self.shared.events_rx)
            .take()
            .ok_or_else(|| EngineError::fault("Engine events already subscribed"))
    }

    fn status(&self) -> EngineStatus {
        *lock(&self.shared.status)
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, EngineError> {
        lock(&self.shared.executed).push(request.clone());
        let steps = lock(&self.shared.scripts)
            .get(&request.command)
            .cloned()
            .unwrap_or_default();
        let nested = self.status() == EngineStatus::Stopped;
        let mut abort_rx = self.shared.abort_tx.subscribe();

        if nested {
            return self.play(steps, &mut abort_rx).await;
        }

        let running = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_running.fetch_max(running, Ordering::SeqCst);
        if let Some(script) = &request.script {
            *lock(&self.shared.current_script) = Some(script.clone());
        }
        self.set_status(EngineStatus::Busy);

        let result = self.play(steps, &mut abort_rx).await;

        self.shared.running.fetch_sub(1, Ordering::SeqCst);
        self.set_status(EngineStatus::Idle);
        result
    }

    async fn abort(&self) -> Result<(), EngineError> {
        self.shared.aborts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.ignore_aborts.load(Ordering::SeqCst) {
            self.shared.abort_tx.send_modify(|n| *n += 1);
        }
        Ok(())
    }

    async fn break_execution(&self) -> Result<(), EngineError> {
        self.shared.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, action: ResumeAction) -> Result<(), EngineError> {
        if self.status() != EngineStatus::Stopped {
            return Err(EngineError::fault("The debugger is not stopped"));
        }
        lock(&self.shared.resumes).push(action);
        self.emit(EngineEvent::DebuggerResumed(action));
        self.shared.resume_tx.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn set_line_breakpoints(
        &self,
        script: &Path,
        breakpoints: &[LineBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError> {
        self.shared.breakpoint_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.shared.breakpoint_failure).clone() {
            return Err(error);
        }
        let set: Vec<BreakpointInfo> = breakpoints
            .iter()
            .map(|bp| BreakpointInfo {
                id: Some(self.shared.next_breakpoint_id.fetch_add(1, Ordering::SeqCst)),
                verified: true,
                message: None,
                source: Some(script.to_path_buf()),
                line: Some(bp.line),
                column: bp.column,
                command: None,
            })
            .collect();
        for breakpoint in &set {
            self.emit(EngineEvent::BreakpointUpdated {
                change: BreakpointChange::Added,
                breakpoint: breakpoint.clone(),
            });
        }
        Ok(set)
    }

    async fn set_command_breakpoints(
        &self,
        breakpoints: &[CommandBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError> {
        self.shared.breakpoint_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.shared.breakpoint_failure).clone() {
            return Err(error);
        }
        let set: Vec<BreakpointInfo> = breakpoints
            .iter()
            .map(|bp| BreakpointInfo {
                id: Some(self.shared.next_breakpoint_id.fetch_add(1, Ordering::SeqCst)),
                verified: true,
                command: Some(bp.name.clone()),
                ..BreakpointInfo::default()
            })
            .collect();
        for breakpoint in &set {
            self.emit(EngineEvent::BreakpointUpdated {
                change: BreakpointChange::Added,
                breakpoint: breakpoint.clone(),
            });
        }
        Ok(set)
    }

    async fn stack_trace(&self) -> Result<Vec<StackFrameInfo>, EngineError> {
        if self.status() != EngineStatus::Stopped {
            return Err(EngineError::fault("The debugger is not stopped"));
        }
        Ok(vec![StackFrameInfo {
            id: 0,
            name: "<ScriptBlock>".to_owned(),
            source: lock(&self.shared.current_script).clone(),
            line: 1,
            column: 1,
        }])
    }

    async fn scopes(&self, _frame_id: i64) -> Result<Vec<ScopeInfo>, EngineError> {
        Ok(["Local", "Script", "Global"]
            .iter()
            .zip(1..)
            .map(|(name, reference)| ScopeInfo {
                name: (*name).to_owned(),
                variables_reference: reference,
                expensive: *name == "Global",
            })
            .collect())
    }

    async fn variables(&self, reference: i64) -> Result<Vec<VariableInfo>, EngineError> {
        if reference == 1 {
            Ok(lock(&self.shared.variables).clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn set_variable(
        &self,
        reference: i64,
        name: &str,
        value: &str,
    ) -> Result<VariableInfo, EngineError> {
        if reference != 1 {
            return Err(EngineError::fault(format!("Unknown container {reference}")));
        }
        let mut variables = lock(&self.shared.variables);
        let variable = variables
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| EngineError::fault(format!("Variable {name} not found")))?;
        value.clone_into(&mut variable.value);
        Ok(variable.clone())
    }
}

// ============================================================================
// Static Analyzer
// ============================================================================

/// Analyzer that flags every line containing a needle
#[derive(Clone)]
pub struct StaticAnalyzer {
    needle: String,
    rule: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StaticAnalyzer {
    /// Flag lines containing `needle` with `rule`
    pub fn new(needle: &str, rule: &str) -> Self {
        Self {
            needle: needle.to_owned(),
            rule: rule.to_owned(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take `delay` per analysis
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of completed analyses
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for StaticAnalyzer {
    fn name(&self) -> &str {
        "static"
    }

    async fn analyze(&self, file: &ScriptFile) -> Result<Vec<DiagnosticMarker>, BridgeError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(file
            .contents
            .lines()
            .zip(1u32..)
            .filter_map(|(line, number)| {
                let column = line.find(&self.needle)?;
                Some(DiagnosticMarker {
                    rule_name: self.rule.clone(),
                    message: format!("Avoid using '{}'", self.needle),
                    severity: MarkerSeverity::Warning,
                    line: number,
                    column: column as u32 + 1,
                    end_line: number,
                    end_column: (column + self.needle.len()) as u32 + 1,
                    suggested_fix: Some(String::new()),
                })
            })
            .collect())
    }

    async fn format(
        &self,
        file: &ScriptFile,
        _options: &FormatOptions,
    ) -> Result<Option<String>, BridgeError> {
        let formatted: String = file
            .contents
            .lines()
            .map(|line| format!("{}\n", line.trim_end()))
            .collect();
        Ok((formatted != file.contents).then_some(formatted))
    }
}

// ============================================================================
// Recording Fault Sink
// ============================================================================

/// Fault sink that keeps every report
#[derive(Default)]
pub struct RecordingFaultSink {
    faults: Mutex<Vec<Fault>>,
}

impl RecordingFaultSink {
    /// Faults reported so far
    pub fn faults(&self) -> Vec<Fault> {
        lock(&self.faults).clone()
    }
}

impl FaultSink for RecordingFaultSink {
    fn report(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }
}
