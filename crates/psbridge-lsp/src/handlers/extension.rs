// ABOUTME: powerShell/* extension requests: REPL evaluate, module listing, extension commands, version
// ABOUTME: Evaluate and extension commands are fire-and-continue; results arrive as notifications
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::sync::Arc;

use lsp_types::request::{Request as _, ShowMessageRequest};
use lsp_types::{MessageActionItem, MessageType, ShowMessageRequestParams};
use psbridge::engine::{ExecutionRequest, OutputCategory};
use psbridge::outbound::Outbound;
use psbridge::pwsh::quote_literal;
use psbridge::{BridgeError, Dispatcher, ResponseError, SessionCoordinator};
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{
    parse_json_list, EvaluateParams, EvaluateResult, ExtensionCommandCompletedParams,
    InvokeExtensionCommandParams, ModuleInfo, OutputParams, VersionInfo,
    EXTENSION_COMMAND_COMPLETED_NOTIFICATION, OUTPUT_NOTIFICATION, SERVER_VERSION,
};
use crate::state::SharedState;

/// Module listing run for `powerShell/getModules`
pub const MODULES_COMMAND: &str = "Get-Module -ListAvailable | \
Select-Object Name, @{n='Version';e={[string]$_.Version}}, Path | \
ConvertTo-Json -Compress";

/// Engine version query run for `powerShell/getVersion`
pub const VERSION_COMMAND: &str = "$PSVersionTable.PSVersion.ToString(); $PSVersionTable.PSEdition";

/// Script that runs an editor command with its context bound to `$Context`
pub fn extension_command_text(name: &str, context: &Value) -> String {
    format!(
        "$Context = {} | ConvertFrom-Json; & {} $Context",
        quote_literal(&context.to_string()),
        quote_literal(name)
    )
}

/// Action offered after an extension command fails
pub const RETRY_ACTION: &str = "Retry";

fn failure_prompt(name: &str, message: &str) -> ShowMessageRequestParams {
    ShowMessageRequestParams {
        typ: MessageType::ERROR,
        message: format!("Extension command '{name}' failed: {message}"),
        actions: Some(vec![MessageActionItem {
            title: RETRY_ACTION.to_owned(),
            properties: HashMap::new(),
        }]),
    }
}

/// Run an editor command in the background and report its completion
///
/// When `offer_retry` is set, a failure is followed by a
/// `window/showMessageRequest`; choosing the retry action runs the command
/// once more.
pub fn invoke_extension_command(
    session: &SessionCoordinator,
    outbound: Outbound,
    name: String,
    context: Value,
    offer_retry: bool,
) {
    let request = ExecutionRequest::command(extension_command_text(&name, &context)).with_output(true);
    let retry_session = session.clone();
    session.execute_detached(request, move |result| async move {
        let failure = match &result {
            Ok(output) if output.had_errors => Some("the command wrote errors".to_owned()),
            Ok(_) => None,
            Err(e) => {
                warn!(command = %name, error = %e, "Extension command failed");
                Some(e.message.clone())
            }
        };
        outbound.send_event(
            EXTENSION_COMMAND_COMPLETED_NOTIFICATION,
            &ExtensionCommandCompletedParams {
                name: name.clone(),
                success: failure.is_none(),
                message: result.err().map(|e| e.message),
            },
        )?;

        let Some(reason) = failure.filter(|_| offer_retry) else {
            return Ok(());
        };
        let answer = outbound
            .send_request(ShowMessageRequest::METHOD, &failure_prompt(&name, &reason))
            .await?;
        let choice: Option<MessageActionItem> = serde_json::from_value(answer).map_err(|e| {
            BridgeError::collaborator("client", format!("Unreadable message action: {e}"))
        })?;
        if choice.is_some_and(|item| item.title == RETRY_ACTION) {
            debug!(command = %name, "Retrying extension command");
            invoke_extension_command(&retry_session, outbound, name, context, false);
        }
        Ok(())
    });
}

/// Register `powerShell/*` extension handlers
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    let s = Arc::clone(state);
    dispatcher.on_request("powerShell/evaluate", move |ctx, params: EvaluateParams| {
        let state = Arc::clone(&s);
        async move {
            let outbound = ctx.outbound().clone();
            let request = ExecutionRequest::command(params.expression)
                .with_output(true)
                .with_history(true);
            state
                .services()
                .session
                .execute_detached(request, move |result| async move {
                    if let Err(e) = result {
                        outbound.send_event(
                            OUTPUT_NOTIFICATION,
                            &OutputParams {
                                category: OutputCategory::Stderr,
                                output: format!("{}\n", e.message),
                            },
                        )?;
                    }
                    Ok::<_, BridgeError>(())
                });
            Ok::<_, ResponseError>(EvaluateResult::default())
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("powerShell/getModules", move |_ctx, _params: Value| {
        let state = Arc::clone(&s);
        async move {
            let services = state.services();
            let output = services
                .session
                .execute_with_timeout(
                    ExecutionRequest::command(MODULES_COMMAND),
                    services.config.evaluate_timeout,
                )
                .await
                .map_err(|e| ResponseError::internal(format!("Module discovery failed: {e}")))?;
            let modules: Vec<ModuleInfo> = parse_json_list(&output.text()).map_err(|e| {
                ResponseError::internal(format!("Unreadable module listing: {e}"))
            })?;
            debug!(count = modules.len(), "Listed modules");
            Ok::<_, ResponseError>(modules)
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request(
        "powerShell/invokeExtensionCommand",
        move |ctx, params: InvokeExtensionCommandParams| {
            let state = Arc::clone(&s);
            async move {
                invoke_extension_command(
                    &state.services().session,
                    ctx.outbound().clone(),
                    params.name,
                    params.context,
                    true,
                );
                Ok::<_, ResponseError>(Value::Null)
            }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_request("powerShell/getVersion", move |_ctx, _params: Value| {
        let state = Arc::clone(&s);
        async move {
            let services = state.services();
            let output = services
                .session
                .execute_with_timeout(
                    ExecutionRequest::command(VERSION_COMMAND),
                    services.config.request_timeout,
                )
                .await
                .map_err(|e| ResponseError::internal(format!("Version query failed: {e}")))?;
            let mut lines = output.lines.into_iter().map(|l| l.trim().to_owned());
            Ok::<_, ResponseError>(VersionInfo {
                version: lines.next().unwrap_or_default(),
                edition: lines.next().unwrap_or_default(),
                server_version: SERVER_VERSION.to_owned(),
            })
        }
    });
}
