// ABOUTME: Language feature handlers: completion, hover, navigation, symbols, code actions, formatting
// ABOUTME: Engine-backed features go through the session with a timeout and degrade to empty results
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::sync::Arc;

use lsp_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, CodeActionParams, CompletionItem,
    CompletionItemKind, CompletionParams, CompletionResponse, DocumentFormattingParams,
    DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams, GotoDefinitionResponse,
    Hover, HoverContents, HoverParams, Location, MarkupContent, MarkupKind, Position as LspPosition,
    Range, ReferenceParams, TextEdit, WorkspaceEdit, WorkspaceSymbolParams,
    WorkspaceSymbolResponse,
};
use psbridge::engine::ExecutionRequest;
use psbridge::pwsh::quote_literal;
use psbridge::workspace::{Position, ScriptFile};
use psbridge::{Dispatcher, ResponseError};
use tracing::debug;

use crate::protocol::{
    location, marker_range, marker_to_diagnostic, parse_json_list, symbol_information,
    to_format_options, to_position, CompletionMatch,
};
use crate::state::{ServerState, SharedState};

// ============================================================================
// Engine Queries
// ============================================================================

/// `TabExpansion2` call completing at `position`
pub fn completion_command(file: &ScriptFile, position: Position) -> Option<String> {
    let offset = file.offset_of(position)?;
    let cursor = file.contents[..offset].encode_utf16().count();
    Some(format!(
        "TabExpansion2 -inputScript {} -cursorColumn {cursor} | \
Select-Object -ExpandProperty CompletionMatches | \
Select-Object CompletionText, ListItemText, @{{n='ResultType';e={{[string]$_.ResultType}}}}, ToolTip | \
ConvertTo-Json -Compress",
        quote_literal(&file.contents)
    ))
}

/// `Get-Help` synopsis lookup for a command name
pub fn help_command(name: &str) -> String {
    format!(
        "Get-Help -Name {} -ErrorAction Stop | Select-Object -ExpandProperty Synopsis",
        quote_literal(name)
    )
}

fn completion_kind(result_type: Option<&str>) -> CompletionItemKind {
    match result_type.unwrap_or_default() {
        "Command" => CompletionItemKind::FUNCTION,
        "Method" => CompletionItemKind::METHOD,
        "Property" => CompletionItemKind::PROPERTY,
        "Variable" => CompletionItemKind::VARIABLE,
        "ParameterName" => CompletionItemKind::FIELD,
        "ParameterValue" => CompletionItemKind::VALUE,
        "Type" => CompletionItemKind::CLASS,
        "Keyword" => CompletionItemKind::KEYWORD,
        "Namespace" => CompletionItemKind::MODULE,
        "ProviderContainer" => CompletionItemKind::FOLDER,
        "ProviderItem" => CompletionItemKind::FILE,
        _ => CompletionItemKind::TEXT,
    }
}

fn completion_item(found: CompletionMatch) -> CompletionItem {
    let label = found
        .list_item_text
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| found.completion_text.clone());
    CompletionItem {
        kind: Some(completion_kind(found.result_type.as_deref())),
        detail: found.tool_tip.filter(|tip| tip.trim() != label),
        insert_text: Some(found.completion_text),
        label,
        ..CompletionItem::default()
    }
}

/// Run a read-only engine query with the request timeout; `None` on any failure
async fn query(state: &ServerState, command: String) -> Option<String> {
    let services = state.services();
    match services
        .session
        .execute_with_timeout(ExecutionRequest::command(command), services.config.request_timeout)
        .await
    {
        Ok(output) => Some(output.text()),
        Err(e) => {
            debug!(error = %e, "Engine query failed, returning empty result");
            None
        }
    }
}

fn document(state: &ServerState, uri: &str) -> Option<ScriptFile> {
    state
        .services()
        .workspace
        .get_file(uri)
        .map_err(|e| debug!(uri, error = %e, "Document unavailable"))
        .ok()
}

/// Position just past the last character of a document
fn document_end(contents: &str) -> LspPosition {
    let line = contents.matches('\n').count() as u32;
    let last = contents.rsplit('\n').next().unwrap_or_default();
    LspPosition::new(line, last.encode_utf16().count() as u32)
}

const fn intersects(a: &Range, b: &Range) -> bool {
    let a_start = (a.start.line, a.start.character);
    let a_end = (a.end.line, a.end.character);
    let b_start = (b.start.line, b.start.character);
    let b_end = (b.end.line, b.end.character);
    !(lt(a_end, b_start) || lt(b_end, a_start))
}

const fn lt(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.0 || (a.0 == b.0 && a.1 < b.1)
}

// ============================================================================
// Handlers
// ============================================================================

async fn completion(state: &ServerState, params: CompletionParams) -> Option<CompletionResponse> {
    let position = params.text_document_position;
    let file = document(state, position.text_document.uri.as_str())?;
    let command = completion_command(&file, to_position(position.position))?;
    let output = query(state, command).await?;
    let matches: Vec<CompletionMatch> = parse_json_list(&output)
        .map_err(|e| debug!(error = %e, "Unreadable completion output"))
        .ok()?;
    Some(CompletionResponse::Array(
        matches.into_iter().map(completion_item).collect(),
    ))
}

async fn hover(state: &ServerState, params: HoverParams) -> Option<Hover> {
    let position = params.text_document_position_params;
    let file = document(state, position.text_document.uri.as_str())?;
    let word = file.word_at(to_position(position.position))?;
    if word.starts_with('$') {
        return None;
    }
    let synopsis = query(state, help_command(word)).await?;
    let synopsis = synopsis.trim();
    if synopsis.is_empty() {
        return None;
    }
    Some(Hover {
        contents: HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value: format!("```powershell\n{word}\n```\n\n{synopsis}"),
        }),
        range: None,
    })
}

async fn definition(
    state: &ServerState,
    params: GotoDefinitionParams,
) -> Option<GotoDefinitionResponse> {
    let position = params.text_document_position_params;
    let file = document(state, position.text_document.uri.as_str())?;
    let others = state.services().workspace.workspace_files();
    let found = state
        .services()
        .symbols
        .find_definition(&file, to_position(position.position), &others)
        .await
        .map_err(|e| debug!(error = %e, "Definition lookup failed"))
        .ok()??;
    location(&found).map(GotoDefinitionResponse::Scalar)
}

async fn references(state: &ServerState, params: ReferenceParams) -> Vec<Location> {
    let position = params.text_document_position;
    let Some(file) = document(state, position.text_document.uri.as_str()) else {
        return Vec::new();
    };
    let others = state.services().workspace.workspace_files();
    state
        .services()
        .symbols
        .find_references(
            &file,
            to_position(position.position),
            &others,
            params.context.include_declaration,
        )
        .await
        .map_err(|e| debug!(error = %e, "Reference lookup failed"))
        .unwrap_or_default()
        .iter()
        .filter_map(location)
        .collect()
}

async fn document_symbols(
    state: &ServerState,
    params: DocumentSymbolParams,
) -> Option<DocumentSymbolResponse> {
    let file = document(state, params.text_document.uri.as_str())?;
    let symbols = state
        .services()
        .symbols
        .document_symbols(&file)
        .await
        .map_err(|e| debug!(error = %e, "Document symbol lookup failed"))
        .ok()?;
    Some(DocumentSymbolResponse::Flat(
        symbols.iter().filter_map(symbol_information).collect(),
    ))
}

async fn workspace_symbols(
    state: &ServerState,
    params: WorkspaceSymbolParams,
) -> Option<WorkspaceSymbolResponse> {
    let files = state.services().workspace.workspace_files();
    let symbols = state
        .services()
        .symbols
        .workspace_symbols(&params.query, &files)
        .await
        .map_err(|e| debug!(error = %e, "Workspace symbol lookup failed"))
        .ok()?;
    Some(WorkspaceSymbolResponse::Flat(
        symbols.iter().filter_map(symbol_information).collect(),
    ))
}

fn code_actions(state: &ServerState, params: &CodeActionParams) -> Vec<CodeActionOrCommand> {
    let uri = &params.text_document.uri;
    let source = state.services().analyzer.name();
    state
        .diagnostics()
        .markers(uri.as_str())
        .into_iter()
        .filter(|marker| intersects(&marker_range(marker), &params.range))
        .filter_map(|marker| {
            let fix = marker.suggested_fix.clone()?;
            let edit = TextEdit::new(marker_range(&marker), fix);
            Some(CodeActionOrCommand::CodeAction(CodeAction {
                title: format!("Fix {}", marker.rule_name),
                kind: Some(CodeActionKind::QUICKFIX),
                diagnostics: Some(vec![marker_to_diagnostic(&marker, source)]),
                edit: Some(WorkspaceEdit {
                    changes: Some(HashMap::from([(uri.clone(), vec![edit])])),
                    ..WorkspaceEdit::default()
                }),
                ..CodeAction::default()
            }))
        })
        .collect()
}

async fn formatting(state: &ServerState, params: DocumentFormattingParams) -> Option<Vec<TextEdit>> {
    let file = document(state, params.text_document.uri.as_str())?;
    let formatted = state
        .services()
        .analyzer
        .format(&file, &to_format_options(&params.options))
        .await
        .map_err(|e| debug!(error = %e, "Formatting failed"))
        .ok()??;
    let whole = Range::new(LspPosition::new(0, 0), document_end(&file.contents));
    Some(vec![TextEdit::new(whole, formatted)])
}

/// Register language feature handlers
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    let s = Arc::clone(state);
    dispatcher.on_request("textDocument/completion", move |_ctx, params: CompletionParams| {
        let state = Arc::clone(&s);
        async move { Ok::<_, ResponseError>(completion(&state, params).await) }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("textDocument/hover", move |_ctx, params: HoverParams| {
        let state = Arc::clone(&s);
        async move { Ok::<_, ResponseError>(hover(&state, params).await) }
    });

    let s = Arc::clone(state);
    dispatcher.on_request(
        "textDocument/definition",
        move |_ctx, params: GotoDefinitionParams| {
            let state = Arc::clone(&s);
            async move { Ok::<_, ResponseError>(definition(&state, params).await) }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_request("textDocument/references", move |_ctx, params: ReferenceParams| {
        let state = Arc::clone(&s);
        async move { Ok::<_, ResponseError>(references(&state, params).await) }
    });

    let s = Arc::clone(state);
    dispatcher.on_request(
        "textDocument/documentSymbol",
        move |_ctx, params: DocumentSymbolParams| {
            let state = Arc::clone(&s);
            async move { Ok::<_, ResponseError>(document_symbols(&state, params).await) }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_request("workspace/symbol", move |_ctx, params: WorkspaceSymbolParams| {
        let state = Arc::clone(&s);
        async move { Ok::<_, ResponseError>(workspace_symbols(&state, params).await) }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("textDocument/codeAction", move |_ctx, params: CodeActionParams| {
        let state = Arc::clone(&s);
        async move { Ok::<_, ResponseError>(code_actions(&state, &params)) }
    });

    let s = Arc::clone(state);
    dispatcher.on_request(
        "textDocument/formatting",
        move |_ctx, params: DocumentFormattingParams| {
            let state = Arc::clone(&s);
            async move { Ok::<_, ResponseError>(formatting(&state, params).await) }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(contents: &str) -> ScriptFile {
        ScriptFile {
            uri: "file:///tmp/a.ps1".to_owned(),
            path: None,
            version: 1,
            contents: contents.to_owned(),
        }
    }

    #[test]
    fn completion_cursor_counts_utf16_units() {
        let command = completion_command(&file("'é'\nGet-Ch"), Position::new(1, 6)).expect("cmd");
        assert!(command.contains("-cursorColumn 10"));
        assert!(command.starts_with("TabExpansion2 -inputScript '''é''"));
    }

    #[test]
    fn completion_outside_document_is_none() {
        assert!(completion_command(&file("x"), Position::new(4, 0)).is_none());
    }

    #[test]
    fn completion_labels_prefer_list_text() {
        let item = completion_item(CompletionMatch {
            completion_text: "Get-ChildItem".to_owned(),
            list_item_text: Some("Get-ChildItem".to_owned()),
            result_type: Some("Command".to_owned()),
            tool_tip: Some("Get-ChildItem [[-Path] <string[]>]".to_owned()),
        });
        assert_eq!(item.label, "Get-ChildItem");
        assert_eq!(item.kind, Some(CompletionItemKind::FUNCTION));
        assert!(item.detail.is_some());
    }

    #[test]
    fn document_end_handles_trailing_newline() {
        assert_eq!(document_end("a\nbc"), LspPosition::new(1, 2));
        assert_eq!(document_end("a\n"), LspPosition::new(1, 0));
    }

    #[test]
    fn ranges_touching_at_an_edge_intersect() {
        let a = Range::new(LspPosition::new(1, 0), LspPosition::new(1, 4));
        let b = Range::new(LspPosition::new(1, 4), LspPosition::new(2, 0));
        let c = Range::new(LspPosition::new(3, 0), LspPosition::new(3, 1));
        assert!(intersects(&a, &b));
        assert!(!intersects(&a, &c));
    }
}
