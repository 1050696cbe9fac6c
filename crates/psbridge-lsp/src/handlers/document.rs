// ABOUTME: Text document synchronization handlers feeding the workspace store
// ABOUTME: Every open, change, and save reschedules diagnostics; close clears them
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams,
};
use psbridge::workspace::TextChange;
use psbridge::{BridgeError, Dispatcher};
use tracing::debug;

use crate::protocol::to_change;
use crate::state::SharedState;

/// Register document sync handlers
///
/// All of them are ordered so edits apply in the order the client sent them.
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    let s = Arc::clone(state);
    dispatcher.on_ordered_event(
        "textDocument/didOpen",
        move |_ctx, params: DidOpenTextDocumentParams| {
            let state = Arc::clone(&s);
            async move {
                if !state.is_ready() {
                    debug!("Ignoring didOpen outside the ready phase");
                    return Ok(());
                }
                let doc = params.text_document;
                let uri = doc.uri.to_string();
                state
                    .services()
                    .workspace
                    .open(&uri, doc.version, doc.text);
                state.diagnostics().schedule(&uri);
                Ok(())
            }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_ordered_event(
        "textDocument/didChange",
        move |_ctx, params: DidChangeTextDocumentParams| {
            let state = Arc::clone(&s);
            async move {
                if !state.is_ready() {
                    return Ok(());
                }
                let uri = params.text_document.uri.to_string();
                let changes: Vec<TextChange> =
                    params.content_changes.into_iter().map(to_change).collect();
                state.services().workspace.change(
                    &uri,
                    params.text_document.version,
                    &changes,
                )?;
                state.diagnostics().schedule(&uri);
                Ok::<_, BridgeError>(())
            }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_ordered_event(
        "textDocument/didSave",
        move |_ctx, params: DidSaveTextDocumentParams| {
            let state = Arc::clone(&s);
            async move {
                if !state.is_ready() {
                    return Ok(());
                }
                let uri = params.text_document.uri.to_string();
                if let Some(text) = params.text {
                    let version = state
                        .services()
                        .workspace
                        .get_file(&uri)
                        .map_or(0, |file| file.version);
                    state.services().workspace.open(&uri, version, text);
                }
                state.diagnostics().schedule(&uri);
                Ok(())
            }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_ordered_event(
        "textDocument/didClose",
        move |_ctx, params: DidCloseTextDocumentParams| {
            let state = Arc::clone(&s);
            async move {
                if !state.is_ready() {
                    return Ok(());
                }
                let uri = params.text_document.uri.to_string();
                if !state.services().workspace.close(&uri) {
                    debug!(%uri, "Closed a document that was not open");
                }
                state.diagnostics().clear(&uri);
                Ok(())
            }
        },
    );
}
