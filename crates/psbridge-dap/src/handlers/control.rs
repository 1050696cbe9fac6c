// ABOUTME: continue, next, stepIn, stepOut, and pause
// ABOUTME: Debugger controls reach the engine directly, bypassing the execution queue
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use psbridge::engine::ResumeAction;
use psbridge::{Dispatcher, ResponseError};
use serde_json::Value;

use super::engine_failure;
use crate::protocol::ContinueResponse;
use crate::state::SharedState;

fn register_step(
    dispatcher: &mut Dispatcher,
    state: &SharedState,
    command: &str,
    action: ResumeAction,
) {
    let s = Arc::clone(state);
    dispatcher.on_request(command, move |_ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            state.session().resume(action).await.map_err(engine_failure)?;
            Ok::<_, ResponseError>(Value::Null)
        }
    });
}

/// Register execution control commands
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    let s = Arc::clone(state);
    dispatcher.on_request("continue", move |_ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            state
                .session()
                .resume(ResumeAction::Continue)
                .await
                .map_err(engine_failure)?;
            Ok::<_, ResponseError>(ContinueResponse {
                all_threads_continued: true,
            })
        }
    });

    register_step(dispatcher, state, "next", ResumeAction::StepOver);
    register_step(dispatcher, state, "stepIn", ResumeAction::StepInto);
    register_step(dispatcher, state, "stepOut", ResumeAction::StepOut);

    let s = Arc::clone(state);
    dispatcher.on_request("pause", move |_ctx, _args: Value| {
        let state = Arc::clone(&s);
        async move {
            state
                .session()
                .break_execution()
                .await
                .map_err(engine_failure)?;
            Ok::<_, ResponseError>(Value::Null)
        }
    });
}
