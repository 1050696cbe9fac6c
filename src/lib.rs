// ABOUTME: Core of the PowerShell editor bridge shared by the LSP and DAP endpoints
// ABOUTME: Re-exports the framed transport, dual-protocol dispatcher, and session coordinator
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # psbridge: Editor Bridge Core
//!
//! Library behind the `psbridge-lsp` and `psbridge-dap` binaries. Both
//! endpoints speak `Content-Length` framed JSON over stdio or a local pipe,
//! dispatch messages to method-keyed handlers, and share one
//! [`SessionCoordinator`] that serializes every command sent to the
//! [`ScriptingEngine`](engine::ScriptingEngine).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use psbridge::{Dispatcher, JsonRpcDialect, ResponseError, TransportChannel, TransportKind};
//!
//! # async fn example() -> Result<(), psbridge::BridgeError> {
//! let mut dispatcher = Dispatcher::new(JsonRpcDialect);
//! dispatcher.on_request("echo", |_ctx, params: serde_json::Value| async move {
//!     Ok::<_, ResponseError>(params)
//! });
//! let channel = TransportChannel::open(&TransportKind::Stdio).await?;
//! dispatcher.serve(channel).await
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: bridge error type and classification
//! - [`message`], [`dialect`], [`codec`]: neutral message model, JSON-RPC
//!   and DAP envelopes, `Content-Length` framing
//! - [`transport`]: stdio and named pipe / Unix socket channels
//! - [`dispatcher`], [`context`], [`outbound`]: handler registry, per-message
//!   contexts, and server-initiated traffic
//! - [`engine`]: scripting engine contract and event model
//! - [`session`]: execution queue, event pump, and pending request table
//! - [`workspace`], [`analysis`], [`symbols`]: document store, static analysis
//!   and symbol collaborators
//! - [`pwsh`], [`process`], [`sandbox`], [`discovery`]: default subprocess engine
//! - [`config`]: defaults, environment overrides, optional TOML file

/// Bridge error type and classification
pub mod types;

/// Persisted breakpoint mirror
pub mod breakpoints;
/// Static analysis and formatting
pub mod analysis;
/// `Content-Length` framing and the single writer task
pub mod codec;
/// Configuration defaults and overrides
pub mod config;
/// Request and event handler contexts
pub mod context;
/// JSON-RPC and DAP wire envelopes
pub mod dialect;
/// PowerShell binary discovery
pub mod discovery;
/// Method-keyed message dispatch
pub mod dispatcher;
/// Scripting engine contract
pub mod engine;
/// Protocol-neutral message model
pub mod message;
/// Server-initiated events and requests
pub mod outbound;
/// Engine output buffering
pub mod output;
/// Requests waiting for the session to settle
pub mod pending;
/// Subprocess spawning with safety limits
pub mod process;
/// Subprocess-backed default engine
pub mod pwsh;
/// Environment sandboxing
pub mod sandbox;
/// Session coordinator
pub mod session;
/// Symbol provider
pub mod symbols;
/// Byte-stream transports
pub mod transport;
/// Open-document store
pub mod workspace;

/// Fakes for the collaborator traits
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::BridgeConfig;
pub use context::{EventContext, RequestContext};
pub use dialect::{DapDialect, JsonRpcDialect, WireDialect};
pub use dispatcher::{CountingFaultSink, Dispatcher, Fault, FaultKind, FaultSink, LogFaultSink};
pub use message::{Message, RequestId, ResponseError};
pub use pwsh::PwshEngine;
pub use session::{SessionCoordinator, SessionEvent, SessionState};
pub use transport::{TransportChannel, TransportKind};
pub use types::{BridgeError, ErrorKind};
