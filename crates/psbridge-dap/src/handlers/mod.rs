// ABOUTME: Registers every debug adapter command on the dispatcher
// ABOUTME: Handlers are grouped by session setup, breakpoints, execution control, and inspection
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use psbridge::engine::EngineError;
use psbridge::{Dispatcher, ResponseError};

use crate::state::SharedState;

/// Breakpoint commands
pub mod breakpoints;
/// Continue, step, and pause
pub mod control;
/// Threads, stack, variables, and evaluate
pub mod inspection;
/// initialize, launch, attach, configurationDone, disconnect
pub mod session;

/// Register all debug adapter commands
pub fn register_all(dispatcher: &mut Dispatcher, state: &SharedState) {
    session::register(dispatcher, state);
    breakpoints::register(dispatcher, state);
    control::register(dispatcher, state);
    inspection::register(dispatcher, state);
}

/// Failed engine call as a failed response
pub(crate) fn engine_failure(error: EngineError) -> ResponseError {
    ResponseError::internal(error.message)
}
