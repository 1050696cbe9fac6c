// ABOUTME: initialize, initialized, shutdown, and exit handlers
// ABOUTME: Advertises server capabilities and drives the connection towards its exit code
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use lsp_types::{
    CodeActionProviderCapability, CompletionOptions, HoverProviderCapability, InitializeParams,
    InitializeResult, OneOf, ServerCapabilities, ServerInfo,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
    TextDocumentSyncSaveOptions,
};
use psbridge::{Dispatcher, ResponseError};
use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::{SERVER_NAME, SERVER_VERSION};
use crate::state::SharedState;

/// Capabilities advertised in the `initialize` response
pub fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(TextDocumentSyncKind::INCREMENTAL),
            save: Some(TextDocumentSyncSaveOptions::Supported(true)),
            ..TextDocumentSyncOptions::default()
        })),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec![
                ".".to_owned(),
                "-".to_owned(),
                ":".to_owned(),
                "\\".to_owned(),
                "$".to_owned(),
            ]),
            ..CompletionOptions::default()
        }),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        definition_provider: Some(OneOf::Left(true)),
        references_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
        document_formatting_provider: Some(OneOf::Left(true)),
        ..ServerCapabilities::default()
    }
}

/// Register lifecycle handlers
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    dispatcher.on_request("initialize", |_ctx, params: InitializeParams| async move {
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = ?client.version, "LSP client connected");
        }
        Ok::<_, ResponseError>(InitializeResult {
            capabilities: server_capabilities(),
            server_info: Some(ServerInfo {
                name: SERVER_NAME.to_owned(),
                version: Some(SERVER_VERSION.to_owned()),
            }),
        })
    });

    dispatcher.on_event("initialized", |_ctx, _params: Value| async move {
        debug!("Client finished initialization");
        Ok(())
    });

    let s = Arc::clone(state);
    dispatcher.on_request("shutdown", move |_ctx, _params: Value| {
        let state = Arc::clone(&s);
        async move {
            state.services().session.shutdown();
            Ok::<_, ResponseError>(Value::Null)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_ordered_event("exit", move |ctx, _params: Value| {
        let state = Arc::clone(&s);
        async move {
            state.exit();
            state.services().session.terminate("Language server exited");
            ctx.shutdown();
            Ok(())
        }
    });

    // Engine work is only interruptible through the engine abort
    dispatcher.on_event("$/cancelRequest", |_ctx, _params: Value| async move { Ok(()) });
    dispatcher.on_event("$/setTrace", |_ctx, _params: Value| async move { Ok(()) });
}
