// ABOUTME: Contract for the interactive scripting engine behind both protocol endpoints
// ABOUTME: Defines execution requests, debugger controls, and the closed set of engine events
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Scripting Engine
//!
//! The engine runs one top-level command at a time. When a breakpoint or a
//! step stops that command, the engine sits in a nested debug prompt: the
//! pending [`ScriptingEngine::execute`] future stays unresolved and further
//! `execute` calls run inside the prompt until the debugger resumes.
//!
//! Asynchronous state changes are delivered, in order, as [`EngineEvent`]s on
//! the channel returned by [`ScriptingEngine::subscribe`].

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Error category
    pub kind: EngineErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// Categories of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The command failed; the engine is still usable
    Fault,
    /// The command was aborted before it finished
    Aborted,
    /// The operation is not supported by this engine
    Unsupported,
    /// The operation did not finish in time
    Timeout,
    /// The engine can no longer run anything
    Unusable,
}

impl EngineError {
    /// Create a command fault
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Fault,
            message: message.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Aborted,
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: &str) -> Self {
        Self {
            kind: EngineErrorKind::Unsupported,
            message: format!("{operation} is not supported by this engine"),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Create an unusable-engine error
    pub fn unusable(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Unusable,
            message: message.into(),
        }
    }

    /// Whether the engine must be considered dead after this error
    #[must_use]
    pub const fn is_unusable(&self) -> bool {
        matches!(self.kind, EngineErrorKind::Unusable)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

// ============================================================================
// Execution
// ============================================================================

/// A command for the engine to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Script text, or the script path when `script` is set
    pub command: String,
    /// Script file to run instead of inline text
    pub script: Option<PathBuf>,
    /// Arguments passed to the script file
    pub arguments: Vec<String>,
    /// Whether output should be written to the host (and forwarded as events)
    pub write_output: bool,
    /// Whether the command is recorded in the session history
    pub add_to_history: bool,
    /// Break before the first statement
    pub stop_on_entry: bool,
}

impl ExecutionRequest {
    /// Run inline script text, collecting output without echoing it
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            script: None,
            arguments: Vec::new(),
            write_output: false,
            add_to_history: false,
            stop_on_entry: false,
        }
    }

    /// Run a script file with arguments, echoing its output
    pub fn script(path: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        let path = path.into();
        Self {
            command: path.display().to_string(),
            script: Some(path),
            arguments,
            write_output: true,
            add_to_history: false,
            stop_on_entry: false,
        }
    }

    /// Echo output to the host
    #[must_use]
    pub const fn with_output(mut self, write_output: bool) -> Self {
        self.write_output = write_output;
        self
    }

    /// Record the command in history
    #[must_use]
    pub const fn with_history(mut self, add_to_history: bool) -> Self {
        self.add_to_history = add_to_history;
        self
    }

    /// Break before the first statement
    #[must_use]
    pub const fn with_stop_on_entry(mut self, stop_on_entry: bool) -> Self {
        self.stop_on_entry = stop_on_entry;
        self
    }

    /// Short label for logs
    pub fn label(&self) -> &str {
        let first = self.command.lines().next().unwrap_or_default();
        first.get(..first.len().min(80)).unwrap_or(first)
    }
}

/// Result of a completed execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Output objects rendered as text, one per line
    pub lines: Vec<String>,
    /// Whether the command wrote to the error stream
    pub had_errors: bool,
}

impl ExecutionOutput {
    /// Output joined with newlines
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Coarse engine activity reported by [`ScriptingEngine::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    /// Waiting for a command
    #[default]
    Idle,
    /// Running a command
    Busy,
    /// Suspended in the nested debug prompt
    Stopped,
    /// No longer able to run commands
    Unusable,
}

// ============================================================================
// Debugger Types
// ============================================================================

/// Why the debugger stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// A line breakpoint was hit
    Breakpoint,
    /// A command (function) breakpoint was hit
    CommandBreakpoint,
    /// A step completed
    Step,
    /// A pause request was honoured
    Pause,
    /// Stopped before the first statement
    Entry,
    /// An exception was raised
    Exception,
}

impl StopReason {
    /// Reason string used on the wire
    #[must_use]
    pub const fn as_protocol(&self) -> &'static str {
        match self {
            Self::Breakpoint => "breakpoint",
            Self::CommandBreakpoint => "function breakpoint",
            Self::Step => "step",
            Self::Pause => "pause",
            Self::Entry => "entry",
            Self::Exception => "exception",
        }
    }
}

/// How to leave the nested prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Run until the next breakpoint
    Continue,
    /// Step over the current statement
    StepOver,
    /// Step into the current statement
    StepInto,
    /// Run until the current function returns
    StepOut,
}

/// Details attached to a debugger stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopDetails {
    /// Why execution stopped
    pub reason: StopReason,
    /// Ids of the breakpoints that were hit
    pub breakpoint_ids: Vec<i64>,
    /// Script containing the current statement
    pub script: Option<PathBuf>,
    /// One-based line of the current statement
    pub line: Option<u32>,
    /// Extra text, such as the exception message
    pub description: Option<String>,
}

impl StopDetails {
    /// Stop with only a reason
    pub const fn new(reason: StopReason) -> Self {
        Self {
            reason,
            breakpoint_ids: Vec::new(),
            script: None,
            line: None,
            description: None,
        }
    }
}

/// Requested line breakpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBreakpoint {
    /// One-based line
    pub line: u32,
    /// One-based column
    pub column: Option<u32>,
    /// Break only when this expression is true
    pub condition: Option<String>,
    /// Break only when the hit count matches
    pub hit_condition: Option<String>,
    /// Log this message instead of breaking
    pub log_message: Option<String>,
}

/// Requested command (function) breakpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBreakpoint {
    /// Command or function name
    pub name: String,
    /// Break only when this expression is true
    pub condition: Option<String>,
    /// Break only when the hit count matches
    pub hit_condition: Option<String>,
}

/// A breakpoint as known to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointInfo {
    /// Engine-assigned id
    pub id: Option<i64>,
    /// Whether the engine accepted the breakpoint
    pub verified: bool,
    /// Why the breakpoint is not verified
    pub message: Option<String>,
    /// Script for line breakpoints
    pub source: Option<PathBuf>,
    /// One-based line for line breakpoints
    pub line: Option<u32>,
    /// One-based column for line breakpoints
    pub column: Option<u32>,
    /// Command name for command breakpoints
    pub command: Option<String>,
}

impl BreakpointInfo {
    /// An unverified line breakpoint with a reason
    pub fn unverified_line(source: &Path, requested: &LineBreakpoint, reason: &str) -> Self {
        Self {
            id: None,
            verified: false,
            message: Some(reason.to_owned()),
            source: Some(source.to_path_buf()),
            line: Some(requested.line),
            column: requested.column,
            command: None,
        }
    }

    /// An unverified command breakpoint with a reason
    pub fn unverified_command(requested: &CommandBreakpoint, reason: &str) -> Self {
        Self {
            id: None,
            verified: false,
            message: Some(reason.to_owned()),
            source: None,
            line: None,
            column: None,
            command: Some(requested.name.clone()),
        }
    }
}

/// Kind of breakpoint change reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointChange {
    /// A breakpoint was created
    Added,
    /// A breakpoint was removed
    Removed,
    /// A breakpoint was modified
    Updated,
}

/// Where the engine is currently running commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunspaceInfo {
    /// Runspace display name
    pub name: String,
    /// Local, remote, or attached
    pub kind: RunspaceKind,
    /// Remote computer name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer_name: Option<String>,
    /// Attached process id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

/// Category of runspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunspaceKind {
    /// The engine's own runspace
    Local,
    /// A remote session
    Remote,
    /// A runspace in another process
    Attached,
}

/// Output stream a chunk was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    /// Regular output
    Stdout,
    /// Error stream
    Stderr,
    /// Host and informational messages
    Console,
}

impl OutputCategory {
    /// Category name used on the wire
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Console => "console",
        }
    }
}

/// A stack frame of the stopped script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    /// Frame id, valid until the debugger resumes
    pub id: i64,
    /// Function or script block name
    pub name: String,
    /// Script file
    pub source: Option<PathBuf>,
    /// One-based line
    pub line: u32,
    /// One-based column
    pub column: u32,
}

/// A variable container of a stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
    /// Scope name (Local, Script, Global, Auto)
    pub name: String,
    /// Reference used to fetch the scope's variables
    pub variables_reference: i64,
    /// Whether fetching the variables is expensive
    pub expensive: bool,
}

/// A variable value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    /// Variable name
    pub name: String,
    /// Rendered value
    pub value: String,
    /// Type name
    pub type_name: Option<String>,
    /// Non-zero when the value has children
    pub variables_reference: i64,
}

// ============================================================================
// Events
// ============================================================================

/// Asynchronous notifications raised by the engine, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The debugger stopped and the engine entered the nested prompt
    DebuggerStopped(StopDetails),
    /// The debugger left the nested prompt
    DebuggerResumed(ResumeAction),
    /// The active runspace changed
    RunspaceChanged(RunspaceInfo),
    /// Output was written to the host
    OutputWritten {
        /// Stream the output was written to
        category: OutputCategory,
        /// Output text, including any trailing newline
        text: String,
    },
    /// A breakpoint was added, removed, or modified
    BreakpointUpdated {
        /// Kind of change
        change: BreakpointChange,
        /// Breakpoint after the change
        breakpoint: BreakpointInfo,
    },
}

/// Ordered receiver of engine events
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

// ============================================================================
// Engine Trait
// ============================================================================

/// The interactive scripting engine
#[async_trait]
pub trait ScriptingEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Take the ordered event channel; only the first call succeeds
    fn subscribe(&self) -> Result<EngineEvents, EngineError>;

    /// Current activity
    fn status(&self) -> EngineStatus;

    /// Run a command to completion
    ///
    /// While an earlier call is suspended in the nested prompt, this runs
    /// inside that prompt.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, EngineError>;

    /// Stop the running command; the pending `execute` resolves with `Aborted`
    async fn abort(&self) -> Result<(), EngineError>;

    /// Break into the debugger at the next statement
    async fn break_execution(&self) -> Result<(), EngineError>;

    /// Leave the nested prompt
    async fn resume(&self, action: ResumeAction) -> Result<(), EngineError>;

    /// Replace all line breakpoints of a script
    async fn set_line_breakpoints(
        &self,
        script: &Path,
        breakpoints: &[LineBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError>;

    /// Replace all command breakpoints
    async fn set_command_breakpoints(
        &self,
        breakpoints: &[CommandBreakpoint],
    ) -> Result<Vec<BreakpointInfo>, EngineError>;

    /// Call stack of the stopped script, innermost first
    async fn stack_trace(&self) -> Result<Vec<StackFrameInfo>, EngineError>;

    /// Variable scopes of a frame
    async fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>, EngineError>;

    /// Children of a variable container
    async fn variables(&self, reference: i64) -> Result<Vec<VariableInfo>, EngineError>;

    /// Assign a variable in a container
    async fn set_variable(
        &self,
        reference: i64,
        name: &str,
        value: &str,
    ) -> Result<VariableInfo, EngineError>;
}
