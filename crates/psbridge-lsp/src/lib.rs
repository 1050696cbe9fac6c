// ABOUTME: Language server endpoint for psbridge, usable as a library by tests and hosts
// ABOUTME: Wires LSP methods onto the shared dispatcher and session coordinator
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # psbridge-lsp
//!
//! [`LanguageServer`] registers the LSP lifecycle, document sync, language
//! features, and the `powerShell/*` extensions on a JSON-RPC
//! [`Dispatcher`](psbridge::Dispatcher), gates requests by lifecycle phase,
//! and forwards session output as notifications.

/// Debounced analyzer runs
pub mod diagnostics;
/// Method handlers
pub mod handlers;
/// Wire constants and conversions
pub mod protocol;
/// Connection assembly
pub mod server;
/// Lifecycle and collaborators
pub mod state;

pub use server::LanguageServer;
pub use state::{LanguageServices, Lifecycle, ServerState, SharedState};
