// ABOUTME: Debug adapter endpoint for psbridge, usable standalone or hosted by the language server
// ABOUTME: Wires DAP commands onto the shared dispatcher and session coordinator
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # psbridge-dap
//!
//! [`DebugServer`] registers the DAP commands on a
//! [`Dispatcher`](psbridge::Dispatcher) using the DAP envelope, orders
//! `launch`/`attach` against `configurationDone` with a
//! [`LaunchGate`](state::LaunchGate), and turns session events into
//! `output`, `stopped`, `continued`, `breakpoint`, `exited` and
//! `terminated` events.

/// Session event forwarding
pub mod events;
/// Command handlers
pub mod handlers;
/// Wire bodies and conversions
pub mod protocol;
/// Connection assembly
pub mod server;
/// Launch gate and connection state
pub mod state;

pub use server::DebugServer;
pub use state::{DebugState, LaunchGate, SharedState};
