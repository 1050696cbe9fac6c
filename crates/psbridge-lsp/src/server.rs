// ABOUTME: Language server assembly: dispatcher, lifecycle gate, handlers, and session event forwarding
// ABOUTME: Session output and status changes become powerShell/* notifications
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use psbridge::outbound::Outbound;
use psbridge::{
    BridgeError, Dispatcher, FaultSink, JsonRpcDialect, SessionEvent, TransportChannel,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticsScheduler;
use crate::handlers::register_all;
use crate::protocol::{
    ExecutionStatusParams, OutputParams, RunspaceChangedParams, EXECUTION_STATUS_NOTIFICATION,
    OUTPUT_NOTIFICATION, RUNSPACE_CHANGED_NOTIFICATION,
};
use crate::state::{LanguageServices, ServerState, SharedState};

/// One language server connection, ready to serve
pub struct LanguageServer {
    dispatcher: Dispatcher,
    state: SharedState,
}

impl LanguageServer {
    /// Build the dispatcher and register every handler
    pub fn new(services: LanguageServices, fault_sink: Arc<dyn FaultSink>) -> Self {
        let base = Dispatcher::new(JsonRpcDialect).with_fault_sink(fault_sink);
        let diagnostics = DiagnosticsScheduler::new(
            Arc::clone(&services.workspace),
            Arc::clone(&services.analyzer),
            base.outbound(),
            services.config.diagnostics_delay,
        );
        let state = Arc::new(ServerState::new(services, diagnostics));

        let gate = Arc::clone(&state);
        let mut dispatcher = base.with_request_gate(move |method| gate.admit(method));
        register_all(&mut dispatcher, &state);

        Self { dispatcher, state }
    }

    /// Connection state shared with the handlers
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Serve until `exit`, peer disconnect, or a transport failure
    ///
    /// Returns whether the client went through `shutdown` then `exit`.
    pub async fn serve(self, channel: TransportChannel) -> Result<bool, BridgeError> {
        let Self { dispatcher, state } = self;
        let forwarder = forward_session_events(
            state.services().session.subscribe(),
            dispatcher.outbound(),
            dispatcher.stop_token(),
        );

        info!("Language server listening");
        let result = dispatcher.serve(channel).await;
        forwarder.abort();
        result.map(|()| state.exited_cleanly())
    }
}

// ============================================================================
// Session Event Forwarding
// ============================================================================

fn notify<T: serde::Serialize>(outbound: &Outbound, method: &str, params: &T) {
    if let Err(e) = outbound.send_event(method, params) {
        warn!(method, error = %e, "Failed to forward session event");
    }
}

/// Forward one session event; debugger events belong to the debug adapter
pub fn forward_event(outbound: &Outbound, event: SessionEvent) {
    match event {
        SessionEvent::Output(chunk) => notify(
            outbound,
            OUTPUT_NOTIFICATION,
            &OutputParams {
                category: chunk.category,
                output: chunk.text,
            },
        ),
        SessionEvent::RunspaceChanged(runspace) => notify(
            outbound,
            RUNSPACE_CHANGED_NOTIFICATION,
            &RunspaceChangedParams { runspace },
        ),
        SessionEvent::Execution(status) => notify(
            outbound,
            EXECUTION_STATUS_NOTIFICATION,
            &ExecutionStatusParams {
                status: status.as_str().to_owned(),
                reason: None,
            },
        ),
        SessionEvent::Terminated { reason } => notify(
            outbound,
            EXECUTION_STATUS_NOTIFICATION,
            &ExecutionStatusParams {
                status: "terminated".to_owned(),
                reason: Some(reason),
            },
        ),
        SessionEvent::Stopped(_)
        | SessionEvent::Resumed(_)
        | SessionEvent::BreakpointChanged { .. } => {}
    }
}

/// Pump session events to the client until the connection stops
pub fn forward_session_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: Outbound,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => forward_event(&outbound, event),
                    None => {
                        debug!("Session event stream closed");
                        break;
                    }
                },
            }
        }
    })
}
