// ABOUTME: Static analysis and formatting contract plus the PSScriptAnalyzer-backed default
// ABOUTME: Runs Invoke-ScriptAnalyzer and Invoke-Formatter in a sandboxed pwsh subprocess
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::process::run_command;
use crate::sandbox::{apply_sandbox, SandboxPolicy};
use crate::types::BridgeError;
use crate::workspace::ScriptFile;

/// Severity of an analyzer marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSeverity {
    /// Informational
    Information,
    /// Rule violation worth fixing
    Warning,
    /// Rule violation that will likely break the script
    Error,
    /// The script does not parse
    ParseError,
}

/// One analyzer finding; positions are one-based
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMarker {
    /// Rule that produced the marker
    pub rule_name: String,
    /// Finding text
    pub message: String,
    /// Severity
    pub severity: MarkerSeverity,
    /// Start line
    pub line: u32,
    /// Start column
    pub column: u32,
    /// End line
    pub end_line: u32,
    /// End column
    pub end_column: u32,
    /// Replacement text for the marked range, when the rule offers one
    pub suggested_fix: Option<String>,
}

/// Editor formatting preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Indentation width
    pub tab_size: u32,
    /// Indent with spaces instead of tabs
    pub insert_spaces: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            tab_size: 4,
            insert_spaces: true,
        }
    }
}

/// Static analyzer and formatter
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyzer name for logs
    fn name(&self) -> &str;

    /// Findings for a document
    async fn analyze(&self, file: &ScriptFile) -> Result<Vec<DiagnosticMarker>, BridgeError>;

    /// Formatted text, or `None` when the document is already formatted
    async fn format(
        &self,
        file: &ScriptFile,
        options: &FormatOptions,
    ) -> Result<Option<String>, BridgeError>;
}

// ============================================================================
// PSScriptAnalyzer
// ============================================================================

/// Timeout for one analyzer run (30 seconds)
const ANALYZER_TIMEOUT: Duration = Duration::from_secs(30);

const ANALYZE_SCRIPT: &str = "$ErrorActionPreference = 'Stop'; \
$source = [Console]::In.ReadToEnd(); \
Invoke-ScriptAnalyzer -ScriptDefinition $source | \
Select-Object RuleName, Message, @{n='Severity';e={[int]$_.Severity}}, Line, Column, EndLine, EndColumn, \
@{n='SuggestedFix';e={ $_.SuggestedCorrections | Select-Object -First 1 -ExpandProperty Text }} | \
ConvertTo-Json -Depth 3 -Compress";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMarker {
    rule_name: String,
    message: String,
    severity: u8,
    line: Option<u32>,
    column: Option<u32>,
    end_line: Option<u32>,
    end_column: Option<u32>,
    suggested_fix: Option<String>,
}

impl From<RawMarker> for DiagnosticMarker {
    fn from(raw: RawMarker) -> Self {
        let severity = match raw.severity {
            0 => MarkerSeverity::Information,
            1 => MarkerSeverity::Warning,
            3 => MarkerSeverity::ParseError,
            _ => MarkerSeverity::Error,
        };
        let line = raw.line.unwrap_or(1).max(1);
        let column = raw.column.unwrap_or(1).max(1);
        Self {
            rule_name: raw.rule_name,
            message: raw.message,
            severity,
            line,
            column,
            end_line: raw.end_line.unwrap_or(line).max(line),
            end_column: raw.end_column.unwrap_or(column),
            suggested_fix: raw.suggested_fix,
        }
    }
}

/// Parse `ConvertTo-Json` output, which is empty, one object, or an array
fn parse_markers(json: &str) -> Result<Vec<DiagnosticMarker>, BridgeError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawMarker> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
    } else {
        serde_json::from_str(trimmed).map(|one| vec![one])
    }
    .map_err(|e| BridgeError::collaborator("analyzer", format!("Unreadable analyzer output: {e}")))?;
    Ok(raw.into_iter().map(DiagnosticMarker::from).collect())
}

fn format_script(options: &FormatOptions) -> String {
    let kind = if options.insert_spaces { "space" } else { "tab" };
    format!(
        "$ErrorActionPreference = 'Stop'; \
$source = [Console]::In.ReadToEnd(); \
$settings = @{{ IncludeRules = @('PSPlaceOpenBrace','PSUseConsistentIndentation','PSUseConsistentWhitespace'); \
Rules = @{{ PSPlaceOpenBrace = @{{ Enable = $true }}; \
PSUseConsistentIndentation = @{{ Enable = $true; IndentationSize = {}; Kind = '{kind}' }}; \
PSUseConsistentWhitespace = @{{ Enable = $true }} }} }}; \
[Console]::Out.Write((Invoke-Formatter -ScriptDefinition $source -Settings $settings))",
        options.tab_size
    )
}

/// Analyzer that shells out to PSScriptAnalyzer
#[derive(Debug, Clone)]
pub struct ScriptAnalyzerProcess {
    binary: PathBuf,
    policy: SandboxPolicy,
}

impl ScriptAnalyzerProcess {
    /// Analyzer using the given `pwsh` binary and sandbox
    pub const fn new(binary: PathBuf, policy: SandboxPolicy) -> Self {
        Self { binary, policy }
    }

    async fn run(&self, script: &str, input: &str) -> Result<String, BridgeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", script]);
        apply_sandbox(&mut cmd, &self.policy);

        let output = run_command(&mut cmd, Some(input), ANALYZER_TIMEOUT, 0).await?;
        if !output.success() {
            let stderr = output.stderr_text();
            warn!(exit_code = output.exit_code, stderr = %stderr.trim(), "Analyzer run failed");
            return Err(BridgeError::collaborator(
                "analyzer",
                format!("PSScriptAnalyzer exited with code {}", output.exit_code),
            ));
        }
        debug!(duration = ?output.duration, "Analyzer run completed");
        Ok(output.stdout_text())
    }
}

#[async_trait]
impl Analyzer for ScriptAnalyzerProcess {
    fn name(&self) -> &str {
        "PSScriptAnalyzer"
    }

    async fn analyze(&self, file: &ScriptFile) -> Result<Vec<DiagnosticMarker>, BridgeError> {
        let json = self.run(ANALYZE_SCRIPT, &file.contents).await?;
        parse_markers(&json)
    }

    async fn format(
        &self,
        file: &ScriptFile,
        options: &FormatOptions,
    ) -> Result<Option<String>, BridgeError> {
        let formatted = self.run(&format_script(options), &file.contents).await?;
        Ok((formatted != file.contents && !formatted.is_empty()).then_some(formatted))
    }
}
