// ABOUTME: Forwards session events and debuggee exits to the client as DAP events
// ABOUTME: One task owns both streams so output always precedes the events that follow it
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use psbridge::dispatcher::{EXIT_CLEAN, EXIT_FAULT};
use psbridge::outbound::Outbound;
use psbridge::SessionEvent;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    breakpoint_reason, stopped_event, to_breakpoint, BreakpointEvent, ContinuedEvent, ExitedEvent,
    OutputEvent, THREAD_ID,
};
use crate::state::{DebuggeeExit, SharedState};

fn send<T: Serialize>(outbound: &Outbound, event: &str, body: &T) {
    if let Err(e) = outbound.send_event(event, body) {
        warn!(event, error = %e, "Failed to forward debug event");
    }
}

fn send_terminated(outbound: &Outbound, state: &SharedState) {
    if state.claim_terminated() {
        send(outbound, "terminated", &Value::Null);
    }
}

/// Forward one session event
pub fn forward_event(outbound: &Outbound, state: &SharedState, event: SessionEvent) {
    match event {
        SessionEvent::Output(chunk) => send(
            outbound,
            "output",
            &OutputEvent {
                category: chunk.category.as_str().to_owned(),
                output: chunk.text,
            },
        ),
        SessionEvent::Stopped(details) => send(outbound, "stopped", &stopped_event(&details)),
        SessionEvent::Resumed(_) => send(
            outbound,
            "continued",
            &ContinuedEvent {
                thread_id: THREAD_ID,
                all_threads_continued: true,
            },
        ),
        SessionEvent::BreakpointChanged { change, breakpoint } => send(
            outbound,
            "breakpoint",
            &BreakpointEvent {
                reason: breakpoint_reason(change).to_owned(),
                breakpoint: to_breakpoint(&breakpoint),
            },
        ),
        SessionEvent::Terminated { reason } => {
            info!(reason, "Engine session ended");
            let exit_code = if state.disconnected() { EXIT_CLEAN } else { EXIT_FAULT };
            send(outbound, "exited", &ExitedEvent { exit_code });
            send_terminated(outbound, state);
        }
        SessionEvent::RunspaceChanged(_) | SessionEvent::Execution(_) => {}
    }
}

/// Report the end of the debuggee
pub fn forward_exit(outbound: &Outbound, state: &SharedState, exit: DebuggeeExit) {
    if let Some(error) = exit.error {
        send(
            outbound,
            "output",
            &OutputEvent {
                category: "stderr".to_owned(),
                output: format!("{error}\n"),
            },
        );
    }
    send_terminated(outbound, state);
}

/// Pump session events and debuggee exits until the connection stops
///
/// Session events are drained first: the session publishes a command's
/// output before its completion, so an exit never overtakes that output.
pub fn forward_session_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut exits: mpsc::UnboundedReceiver<DebuggeeExit>,
    outbound: Outbound,
    state: SharedState,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => forward_event(&outbound, &state, event),
                    None => {
                        debug!("Session event stream closed");
                        events_open = false;
                    }
                },
                Some(exit) = exits.recv() => forward_exit(&outbound, &state, exit),
                else => break,
            }
        }
    })
}
