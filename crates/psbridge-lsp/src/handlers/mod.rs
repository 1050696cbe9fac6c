// ABOUTME: Handler registration for the language server, grouped by protocol area
// ABOUTME: Lifecycle, document sync, language features, and powerShell/* extensions
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

pub mod document;
pub mod extension;
pub mod language;
pub mod lifecycle;

use psbridge::Dispatcher;

use crate::state::SharedState;

/// Register every language server handler
pub fn register_all(dispatcher: &mut Dispatcher, state: &SharedState) {
    lifecycle::register(dispatcher, state);
    document::register(dispatcher, state);
    language::register(dispatcher, state);
    extension::register(dispatcher, state);
}
