// ABOUTME: threads, stackTrace, scopes, variables, setVariable, and evaluate
// ABOUTME: Console evaluation is fire-and-continue; watch and hover wait with a timeout
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use psbridge::engine::{ExecutionRequest, OutputCategory};
use psbridge::{BridgeError, Dispatcher, ResponseError};
use serde_json::Value;
use tracing::{debug, warn};

use super::engine_failure;
use crate::protocol::{
    to_scope, to_stack_frame, to_variable, EvaluateArguments, EvaluateResponse, OutputEvent,
    ScopesArguments, ScopesResponse, SetVariableArguments, SetVariableResponse,
    StackTraceArguments, StackTraceResponse, Thread, ThreadsResponse, VariablesArguments,
    VariablesResponse, THREAD_ID, THREAD_NAME,
};
use crate::state::SharedState;

/// Result shown for watch and hover expressions that could not be evaluated
pub const UNAVAILABLE: &str = "<unavailable>";

/// Window of frames selected by `startFrame` and `levels`
pub fn frame_window(total: usize, start: Option<usize>, levels: Option<usize>) -> (usize, usize) {
    let start = start.unwrap_or(0).min(total);
    let end = match levels {
        Some(levels) if levels > 0 => start.saturating_add(levels).min(total),
        _ => total,
    };
    (start, end)
}

/// Register inspection commands
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    dispatcher.on_request("threads", |_ctx, _args: Value| async move {
        Ok::<_, ResponseError>(ThreadsResponse {
            threads: vec![Thread {
                id: THREAD_ID,
                name: THREAD_NAME.to_owned(),
            }],
        })
    });

    let s = Arc::clone(state);
    dispatcher.on_request("stackTrace", move |_ctx, args: StackTraceArguments| {
        let state = Arc::clone(&s);
        async move {
            let frames = match state.session().stack_trace().await {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "Stack trace unavailable");
                    return Ok(StackTraceResponse::default());
                }
            };
            let (start, end) = frame_window(frames.len(), args.start_frame, args.levels);
            Ok::<_, ResponseError>(StackTraceResponse {
                stack_frames: frames[start..end].iter().map(to_stack_frame).collect(),
                total_frames: frames.len(),
            })
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("scopes", move |_ctx, args: ScopesArguments| {
        let state = Arc::clone(&s);
        async move {
            let scopes = state
                .session()
                .scopes(args.frame_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(frame = args.frame_id, error = %e, "Scopes unavailable");
                    Vec::new()
                });
            Ok::<_, ResponseError>(ScopesResponse {
                scopes: scopes.into_iter().map(to_scope).collect(),
            })
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("variables", move |_ctx, args: VariablesArguments| {
        let state = Arc::clone(&s);
        async move {
            let variables = state
                .session()
                .variables(args.variables_reference)
                .await
                .unwrap_or_else(|e| {
                    warn!(reference = args.variables_reference, error = %e, "Variables unavailable");
                    Vec::new()
                });
            Ok::<_, ResponseError>(VariablesResponse {
                variables: variables.into_iter().map(to_variable).collect(),
            })
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("setVariable", move |_ctx, args: SetVariableArguments| {
        let state = Arc::clone(&s);
        async move {
            let variable = state
                .session()
                .set_variable(args.variables_reference, &args.name, &args.value)
                .await
                .map_err(engine_failure)?;
            Ok::<_, ResponseError>(SetVariableResponse {
                value: variable.value,
                type_name: variable.type_name,
                variables_reference: variable.variables_reference,
            })
        }
    });

    let s = Arc::clone(state);
    dispatcher.on_request("evaluate", move |ctx, args: EvaluateArguments| {
        let state = Arc::clone(&s);
        async move {
            if args.is_repl() {
                let outbound = ctx.outbound().clone();
                let request = ExecutionRequest::command(args.expression)
                    .with_output(true)
                    .with_history(true);
                state
                    .session()
                    .execute_detached(request, move |result| async move {
                        if let Err(e) = result {
                            outbound.send_event(
                                "output",
                                &OutputEvent {
                                    category: OutputCategory::Stderr.as_str().to_owned(),
                                    output: format!("{}\n", e.message),
                                },
                            )?;
                        }
                        Ok::<_, BridgeError>(())
                    });
                return Ok(EvaluateResponse::default());
            }

            let result = match state
                .session()
                .execute_with_timeout(
                    ExecutionRequest::command(args.expression),
                    state.config().evaluate_timeout,
                )
                .await
            {
                Ok(output) => output.text(),
                Err(e) => {
                    debug!(context = ?args.context, error = %e, "Expression unavailable");
                    UNAVAILABLE.to_owned()
                }
            };
            Ok::<_, ResponseError>(EvaluateResponse {
                result,
                variables_reference: 0,
            })
        }
    });
}
