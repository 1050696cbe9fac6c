// ABOUTME: setBreakpoints, setFunctionBreakpoints, and setExceptionBreakpoints
// ABOUTME: Never fail the request; breakpoints that cannot be set come back unverified with a reason
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use psbridge::engine::{BreakpointInfo, CommandBreakpoint, LineBreakpoint};
use psbridge::{Dispatcher, ResponseError};
use serde_json::Value;
use tracing::debug;

use crate::protocol::{
    source_path, to_breakpoint, to_command_breakpoint, to_line_breakpoint, Breakpoint,
    BreakpointsResponse, SetBreakpointsArguments, SetFunctionBreakpointsArguments,
};
use crate::state::SharedState;

fn respond(breakpoints: &[BreakpointInfo]) -> BreakpointsResponse {
    BreakpointsResponse {
        breakpoints: breakpoints.iter().map(to_breakpoint).collect(),
    }
}

/// Register breakpoint commands
pub fn register(dispatcher: &mut Dispatcher, state: &SharedState) {
    let s = Arc::clone(state);
    dispatcher.on_request(
        "setBreakpoints",
        move |_ctx, args: SetBreakpointsArguments| {
            let state = Arc::clone(&s);
            async move {
                let requested: Vec<LineBreakpoint> =
                    args.breakpoints.iter().map(to_line_breakpoint).collect();
                let Some(path) = source_path(&args.source) else {
                    let breakpoints = requested
                        .iter()
                        .map(|bp| Breakpoint {
                            verified: false,
                            message: Some("Source has no file path".to_owned()),
                            line: Some(bp.line),
                            ..Breakpoint::default()
                        })
                        .collect();
                    return Ok::<_, ResponseError>(BreakpointsResponse { breakpoints });
                };
                let set = state.session().set_line_breakpoints(&path, &requested).await;
                debug!(
                    script = %path.display(),
                    requested = requested.len(),
                    verified = set.iter().filter(|bp| bp.verified).count(),
                    "Line breakpoints set"
                );
                Ok::<_, ResponseError>(respond(&set))
            }
        },
    );

    let s = Arc::clone(state);
    dispatcher.on_request(
        "setFunctionBreakpoints",
        move |_ctx, args: SetFunctionBreakpointsArguments| {
            let state = Arc::clone(&s);
            async move {
                let requested: Vec<CommandBreakpoint> =
                    args.breakpoints.iter().map(to_command_breakpoint).collect();
                let set = state.session().set_command_breakpoints(&requested).await;
                Ok::<_, ResponseError>(respond(&set))
            }
        },
    );

    // Exception filters are not advertised; the request only needs an answer
    dispatcher.on_request("setExceptionBreakpoints", |_ctx, _args: Value| async move {
        Ok::<_, ResponseError>(BreakpointsResponse::default())
    });
}
