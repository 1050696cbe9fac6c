// ABOUTME: LSP wire constants, powerShell/* extension payloads, and lsp-types conversions
// ABOUTME: Maps bridge positions, markers, and symbols onto their protocol shapes
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use lsp_types::{
    Diagnostic, DiagnosticSeverity, Location, NumberOrString, Position as LspPosition, Range,
    SymbolInformation, SymbolKind as LspSymbolKind, TextDocumentContentChangeEvent, Url,
};
use psbridge::analysis::{DiagnosticMarker, FormatOptions, MarkerSeverity};
use psbridge::engine::{OutputCategory, RunspaceInfo};
use psbridge::symbols::{ScriptSymbol, SymbolKind, SymbolLocation};
use psbridge::workspace::{Position, TextChange, TextRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server name reported in `initialize`
pub const SERVER_NAME: &str = "psbridge-lsp";

/// Server version reported in `initialize` and `powerShell/getVersion`
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Notification Methods
// ============================================================================

/// Engine output forwarded to the client
pub const OUTPUT_NOTIFICATION: &str = "powerShell/output";

/// The engine switched runspace
pub const RUNSPACE_CHANGED_NOTIFICATION: &str = "powerShell/runspaceChanged";

/// A top-level execution changed status
pub const EXECUTION_STATUS_NOTIFICATION: &str = "powerShell/executionStatusChanged";

/// A fire-and-continue extension command finished
pub const EXTENSION_COMMAND_COMPLETED_NOTIFICATION: &str = "powerShell/extensionCommandCompleted";

// ============================================================================
// Extension Payloads
// ============================================================================

/// `powerShell/output` params
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParams {
    /// Stream the text was written to
    pub category: OutputCategory,
    /// Text as written
    pub output: String,
}

/// `powerShell/runspaceChanged` params
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunspaceChangedParams {
    /// The runspace now in use
    pub runspace: RunspaceInfo,
}

/// `powerShell/executionStatusChanged` params
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatusParams {
    /// `running`, `completed`, `failed`, `aborted`, or `terminated`
    pub status: String,
    /// Detail for terminal statuses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `powerShell/evaluate` params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    /// Script text typed at the REPL
    pub expression: String,
}

/// `powerShell/evaluate` result; output arrives as notifications
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    /// Always empty
    pub result: String,
    /// Always zero
    pub variables_reference: i64,
}

/// One entry of `powerShell/getModules`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    /// Module name
    #[serde(alias = "Name")]
    pub name: String,
    /// Module version
    #[serde(alias = "Version")]
    pub version: String,
    /// Manifest or module path
    #[serde(alias = "Path", default)]
    pub path: Option<String>,
}

/// `powerShell/invokeExtensionCommand` params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeExtensionCommandParams {
    /// Registered editor command name
    pub name: String,
    /// Editor context passed through to the command
    #[serde(default)]
    pub context: Value,
}

/// `powerShell/extensionCommandCompleted` params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionCommandCompletedParams {
    /// Command that finished
    pub name: String,
    /// Whether it ran without errors
    pub success: bool,
    /// Failure text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `powerShell/getVersion` result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Engine version string
    pub version: String,
    /// Engine edition (`Core` or `Desktop`)
    pub edition: String,
    /// Version of this server
    pub server_version: String,
}

/// One `TabExpansion2` completion match
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletionMatch {
    /// Text inserted on accept
    pub completion_text: String,
    /// Label shown in the list
    #[serde(default)]
    pub list_item_text: Option<String>,
    /// `CompletionResultType` name
    #[serde(default)]
    pub result_type: Option<String>,
    /// Tooltip text
    #[serde(default)]
    pub tool_tip: Option<String>,
}

/// Parse `ConvertTo-Json` output, which is empty, one object, or an array
pub fn parse_json_list<T: serde::de::DeserializeOwned>(
    text: &str,
) -> Result<Vec<T>, serde_json::Error> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
    } else {
        serde_json::from_str(trimmed).map(|one| vec![one])
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Protocol position to bridge position
pub fn to_position(position: LspPosition) -> Position {
    Position::new(position.line, position.character)
}

/// Bridge position to protocol position
pub fn from_position(position: Position) -> LspPosition {
    LspPosition::new(position.line, position.character)
}

/// Bridge range to protocol range
pub fn from_range(range: TextRange) -> Range {
    Range::new(from_position(range.start), from_position(range.end))
}

/// Protocol range to bridge range
pub fn to_range(range: Range) -> TextRange {
    TextRange {
        start: to_position(range.start),
        end: to_position(range.end),
    }
}

/// Content change event to a workspace edit
pub fn to_change(event: TextDocumentContentChangeEvent) -> TextChange {
    TextChange {
        range: event.range.map(to_range),
        text: event.text,
    }
}

/// Editor formatting options to analyzer options
pub fn to_format_options(options: &lsp_types::FormattingOptions) -> FormatOptions {
    FormatOptions {
        tab_size: options.tab_size,
        insert_spaces: options.insert_spaces,
    }
}

/// Zero-based range of a one-based analyzer marker
pub fn marker_range(marker: &DiagnosticMarker) -> Range {
    Range::new(
        LspPosition::new(marker.line.saturating_sub(1), marker.column.saturating_sub(1)),
        LspPosition::new(
            marker.end_line.saturating_sub(1),
            marker.end_column.saturating_sub(1),
        ),
    )
}

/// Analyzer marker to a published diagnostic
pub fn marker_to_diagnostic(marker: &DiagnosticMarker, source: &str) -> Diagnostic {
    let severity = match marker.severity {
        MarkerSeverity::Information => DiagnosticSeverity::INFORMATION,
        MarkerSeverity::Warning => DiagnosticSeverity::WARNING,
        MarkerSeverity::Error | MarkerSeverity::ParseError => DiagnosticSeverity::ERROR,
    };
    Diagnostic {
        range: marker_range(marker),
        severity: Some(severity),
        code: Some(NumberOrString::String(marker.rule_name.clone())),
        source: Some(source.to_owned()),
        message: marker.message.clone(),
        ..Diagnostic::default()
    }
}

/// Declaration keyword to protocol symbol kind
pub const fn symbol_kind(kind: SymbolKind) -> LspSymbolKind {
    match kind {
        SymbolKind::Function | SymbolKind::Filter | SymbolKind::Workflow => LspSymbolKind::FUNCTION,
        SymbolKind::Class => LspSymbolKind::CLASS,
        SymbolKind::Configuration => LspSymbolKind::NAMESPACE,
    }
}

/// Symbol location to a protocol location; `None` when the URI does not parse
pub fn location(location: &SymbolLocation) -> Option<Location> {
    let uri = Url::parse(&location.uri).ok()?;
    Some(Location::new(uri, from_range(location.range)))
}

/// Declared symbol to flat symbol information
#[allow(deprecated)]
pub fn symbol_information(symbol: &ScriptSymbol) -> Option<SymbolInformation> {
    Some(SymbolInformation {
        name: symbol.name.clone(),
        kind: symbol_kind(symbol.kind),
        tags: None,
        deprecated: None,
        location: location(&symbol.location)?,
        container_name: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(severity: MarkerSeverity) -> DiagnosticMarker {
        DiagnosticMarker {
            rule_name: "PSAvoidUsingCmdletAliases".to_owned(),
            message: "'gci' is an alias".to_owned(),
            severity,
            line: 3,
            column: 5,
            end_line: 3,
            end_column: 8,
            suggested_fix: Some("Get-ChildItem".to_owned()),
        }
    }

    #[test]
    fn markers_become_zero_based_diagnostics() {
        let diagnostic = marker_to_diagnostic(&marker(MarkerSeverity::Warning), "PSScriptAnalyzer");
        assert_eq!(diagnostic.range.start, LspPosition::new(2, 4));
        assert_eq!(diagnostic.range.end, LspPosition::new(2, 7));
        assert_eq!(diagnostic.severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(
            diagnostic.code,
            Some(NumberOrString::String("PSAvoidUsingCmdletAliases".to_owned()))
        );
    }

    #[test]
    fn parse_errors_are_errors() {
        let diagnostic = marker_to_diagnostic(&marker(MarkerSeverity::ParseError), "x");
        assert_eq!(diagnostic.severity, Some(DiagnosticSeverity::ERROR));
    }

    #[test]
    fn symbols_with_unparsable_uris_are_dropped() {
        let symbol = ScriptSymbol {
            name: "Get-Thing".to_owned(),
            kind: SymbolKind::Function,
            location: SymbolLocation {
                uri: "not a uri".to_owned(),
                range: TextRange::default(),
            },
        };
        assert!(symbol_information(&symbol).is_none());
    }

    #[test]
    fn json_lists_accept_single_objects() {
        let modules: Vec<ModuleInfo> =
            parse_json_list(r#"{"Name":"Pester","Version":"5.5.0","Path":null}"#).expect("parsed");
        assert_eq!(modules[0].name, "Pester");
        assert!(parse_json_list::<ModuleInfo>("").expect("empty").is_empty());
    }

    #[test]
    fn output_params_use_lowercase_categories() {
        let json = serde_json::to_value(OutputParams {
            category: OutputCategory::Stderr,
            output: "oops".to_owned(),
        })
        .expect("encode");
        assert_eq!(json["category"], "stderr");
    }
}
