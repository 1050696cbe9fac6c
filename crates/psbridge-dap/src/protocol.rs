// ABOUTME: Debug Adapter Protocol argument, response, and event bodies
// ABOUTME: Converts between wire shapes and the engine's breakpoint, frame, and variable types
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::path::{Path, PathBuf};

use psbridge::engine::{
    BreakpointChange, BreakpointInfo, CommandBreakpoint, LineBreakpoint, ScopeInfo,
    StackFrameInfo, StopDetails, VariableInfo,
};
use serde::{Deserialize, Serialize};

/// Adapter name used in logs
pub const ADAPTER_NAME: &str = "psbridge-dap";

/// The engine runs scripts on one thread
pub const THREAD_ID: i64 = 1;

/// Display name of that thread
pub const THREAD_NAME: &str = "Main Thread";

// ============================================================================
// Capabilities
// ============================================================================

/// Capabilities returned from `initialize`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Client should send `configurationDone`
    pub supports_configuration_done_request: bool,
    /// Command breakpoints
    pub supports_function_breakpoints: bool,
    /// Breakpoint conditions
    pub supports_conditional_breakpoints: bool,
    /// Hit-count conditions
    pub supports_hit_conditional_breakpoints: bool,
    /// Log points
    pub supports_log_points: bool,
    /// `evaluate` with the hover context
    pub supports_evaluate_for_hovers: bool,
    /// `setVariable`
    pub supports_set_variable: bool,
    /// `terminate`
    pub supports_terminate_request: bool,
}

/// Capabilities this adapter supports
pub const fn capabilities() -> Capabilities {
    Capabilities {
        supports_configuration_done_request: true,
        supports_function_breakpoints: true,
        supports_conditional_breakpoints: true,
        supports_hit_conditional_breakpoints: true,
        supports_log_points: true,
        supports_evaluate_for_hovers: true,
        supports_set_variable: true,
        supports_terminate_request: true,
    }
}

// ============================================================================
// Request Arguments
// ============================================================================

/// `initialize` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    /// Client identifier
    #[serde(default, rename = "clientID")]
    pub client_id: Option<String>,
    /// Client display name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Adapter type the client asked for
    #[serde(default, rename = "adapterID")]
    pub adapter_id: Option<String>,
}

/// `launch` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    /// Script file, or inline script text when no such file exists
    #[serde(default)]
    pub script: Option<String>,
    /// Arguments passed to the script file
    #[serde(default)]
    pub args: Vec<String>,
    /// Break before the first statement
    #[serde(default)]
    pub stop_on_entry: bool,
}

/// A process id sent either as a number or as text
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProcessId {
    /// Numeric id
    Number(u32),
    /// Id rendered as text
    Text(String),
}

/// `attach` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    /// Remote computer to enter first
    #[serde(default)]
    pub computer_name: Option<String>,
    /// Host process to enter
    #[serde(default)]
    pub process_id: Option<ProcessId>,
    /// Runspace to debug, by id
    #[serde(default)]
    pub runspace_id: Option<u32>,
    /// Runspace to debug, by name
    #[serde(default)]
    pub runspace_name: Option<String>,
}

/// A source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// File system path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Requested line breakpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    /// One-based line
    pub line: u32,
    /// One-based column
    #[serde(default)]
    pub column: Option<u32>,
    /// Break condition
    #[serde(default)]
    pub condition: Option<String>,
    /// Hit-count condition
    #[serde(default)]
    pub hit_condition: Option<String>,
    /// Log message for log points
    #[serde(default)]
    pub log_message: Option<String>,
}

/// `setBreakpoints` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    /// Script the breakpoints belong to
    pub source: Source,
    /// Full replacement set
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpoint>,
}

/// Requested function breakpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionBreakpoint {
    /// Command or function name
    pub name: String,
    /// Break condition
    #[serde(default)]
    pub condition: Option<String>,
    /// Hit-count condition
    #[serde(default)]
    pub hit_condition: Option<String>,
}

/// `setFunctionBreakpoints` arguments
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetFunctionBreakpointsArguments {
    /// Full replacement set
    #[serde(default)]
    pub breakpoints: Vec<FunctionBreakpoint>,
}

/// `stackTrace` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    /// Thread to inspect
    #[serde(default)]
    pub thread_id: i64,
    /// First frame to return
    #[serde(default)]
    pub start_frame: Option<usize>,
    /// Maximum number of frames; zero means all
    #[serde(default)]
    pub levels: Option<usize>,
}

/// `scopes` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    /// Frame whose scopes are wanted
    pub frame_id: i64,
}

/// `variables` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    /// Container to expand
    pub variables_reference: i64,
}

/// `setVariable` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableArguments {
    /// Container holding the variable
    pub variables_reference: i64,
    /// Variable name
    pub name: String,
    /// New value expression
    pub value: String,
}

/// `evaluate` arguments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    /// Expression text
    pub expression: String,
    /// Frame the expression refers to
    #[serde(default)]
    pub frame_id: Option<i64>,
    /// `repl`, `watch`, `hover`, or `clipboard`
    #[serde(default)]
    pub context: Option<String>,
}

impl EvaluateArguments {
    /// Whether the expression came from the debug console
    pub fn is_repl(&self) -> bool {
        matches!(self.context.as_deref(), None | Some("repl"))
    }
}

// ============================================================================
// Response Bodies
// ============================================================================

/// A breakpoint as reported to the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// Engine-assigned id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Whether the engine accepted it
    pub verified: bool,
    /// Why it was not accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Script of a line breakpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Line of a line breakpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Column of a line breakpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Body of `setBreakpoints` and `setFunctionBreakpoints`
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakpointsResponse {
    /// One entry per requested breakpoint, in request order
    pub breakpoints: Vec<Breakpoint>,
}

/// Body of `continue`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponse {
    /// Always true: there is one thread
    pub all_threads_continued: bool,
}

/// A debuggee thread
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    /// Thread id
    pub id: i64,
    /// Display name
    pub name: String,
}

/// Body of `threads`
#[derive(Debug, Clone, Serialize)]
pub struct ThreadsResponse {
    /// Known threads
    pub threads: Vec<Thread>,
}

/// A stack frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Frame id
    pub id: i64,
    /// Function or script block name
    pub name: String,
    /// Script file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// One-based line
    pub line: u32,
    /// One-based column
    pub column: u32,
}

/// Body of `stackTrace`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponse {
    /// Requested slice of frames
    pub stack_frames: Vec<StackFrame>,
    /// Frames available in total
    pub total_frames: usize,
}

/// A variable container
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Scope name
    pub name: String,
    /// Reference used with `variables`
    pub variables_reference: i64,
    /// Whether fetching is expensive
    pub expensive: bool,
}

/// Body of `scopes`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScopesResponse {
    /// Scopes of the frame
    pub scopes: Vec<Scope>,
}

/// A variable
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Rendered value
    pub value: String,
    /// Type name
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the value can be expanded
    pub variables_reference: i64,
}

/// Body of `variables`
#[derive(Debug, Clone, Default, Serialize)]
pub struct VariablesResponse {
    /// Variables of the container
    pub variables: Vec<Variable>,
}

/// Body of `setVariable`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableResponse {
    /// Value after assignment
    pub value: String,
    /// Type name after assignment
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Non-zero when the value can be expanded
    pub variables_reference: i64,
}

/// Body of `evaluate`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    /// Rendered result
    pub result: String,
    /// Non-zero when the result can be expanded
    pub variables_reference: i64,
}

// ============================================================================
// Events
// ============================================================================

/// Body of `output`
#[derive(Debug, Clone, Serialize)]
pub struct OutputEvent {
    /// `stdout`, `stderr`, or `console`
    pub category: String,
    /// Text, including newlines
    pub output: String,
}

/// Body of `stopped`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    /// Protocol stop reason
    pub reason: String,
    /// Extra detail, such as an exception message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stopped thread
    pub thread_id: i64,
    /// Always true: there is one thread
    pub all_threads_stopped: bool,
    /// Breakpoints that were hit
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hit_breakpoint_ids: Vec<i64>,
}

/// Body of `continued`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEvent {
    /// Resumed thread
    pub thread_id: i64,
    /// Always true: there is one thread
    pub all_threads_continued: bool,
}

/// Body of `breakpoint`
#[derive(Debug, Clone, Serialize)]
pub struct BreakpointEvent {
    /// `new`, `removed`, or `changed`
    pub reason: String,
    /// Breakpoint after the change
    pub breakpoint: Breakpoint,
}

/// Body of `exited`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEvent {
    /// Debuggee exit code
    pub exit_code: i32,
}

// ============================================================================
// Conversions
// ============================================================================

/// Source descriptor for a script path
pub fn source_for(path: &Path) -> Source {
    Source {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        path: Some(path.display().to_string()),
    }
}

/// Script path named by a source descriptor
pub fn source_path(source: &Source) -> Option<PathBuf> {
    source
        .path
        .as_deref()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Engine breakpoint from a requested line breakpoint
pub fn to_line_breakpoint(requested: &SourceBreakpoint) -> LineBreakpoint {
    LineBreakpoint {
        line: requested.line,
        column: requested.column,
        condition: requested.condition.clone(),
        hit_condition: requested.hit_condition.clone(),
        log_message: requested.log_message.clone(),
    }
}

/// Engine breakpoint from a requested function breakpoint
pub fn to_command_breakpoint(requested: &FunctionBreakpoint) -> CommandBreakpoint {
    CommandBreakpoint {
        name: requested.name.clone(),
        condition: requested.condition.clone(),
        hit_condition: requested.hit_condition.clone(),
    }
}

/// Wire breakpoint from an engine breakpoint
pub fn to_breakpoint(info: &BreakpointInfo) -> Breakpoint {
    Breakpoint {
        id: info.id,
        verified: info.verified,
        message: info.message.clone(),
        source: info.source.as_deref().map(source_for),
        line: info.line,
        column: info.column,
    }
}

/// `breakpoint` event reason for an engine change
pub const fn breakpoint_reason(change: BreakpointChange) -> &'static str {
    match change {
        BreakpointChange::Added => "new",
        BreakpointChange::Removed => "removed",
        BreakpointChange::Updated => "changed",
    }
}

/// `stopped` event body for an engine stop
pub fn stopped_event(details: &StopDetails) -> StoppedEvent {
    StoppedEvent {
        reason: details.reason.as_protocol().to_owned(),
        description: details.description.clone(),
        thread_id: THREAD_ID,
        all_threads_stopped: true,
        hit_breakpoint_ids: details.breakpoint_ids.clone(),
    }
}

/// Wire frame from an engine frame
pub fn to_stack_frame(frame: &StackFrameInfo) -> StackFrame {
    StackFrame {
        id: frame.id,
        name: frame.name.clone(),
        source: frame.source.as_deref().map(source_for),
        line: frame.line,
        column: frame.column,
    }
}

/// Wire scope from an engine scope
pub fn to_scope(scope: ScopeInfo) -> Scope {
    Scope {
        name: scope.name,
        variables_reference: scope.variables_reference,
        expensive: scope.expensive,
    }
}

/// Wire variable from an engine variable
pub fn to_variable(variable: VariableInfo) -> Variable {
    Variable {
        name: variable.name,
        value: variable.value,
        type_name: variable.type_name,
        variables_reference: variable.variables_reference,
    }
}
