// ABOUTME: Debug adapter assembly: dispatcher, initialize gate, handlers, and event forwarding
// ABOUTME: Shares the session coordinator with any other endpoint in the same process
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::Arc;

use psbridge::{
    BridgeConfig, BridgeError, DapDialect, Dispatcher, FaultSink, SessionCoordinator,
    TransportChannel,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::events::forward_session_events;
use crate::handlers::register_all;
use crate::state::{DebugState, DebuggeeExit, SharedState};

/// One debug adapter connection, ready to serve
pub struct DebugServer {
    dispatcher: Dispatcher,
    state: SharedState,
    exits: mpsc::UnboundedReceiver<DebuggeeExit>,
}

impl DebugServer {
    /// Build the dispatcher and register every command
    pub fn new(
        session: SessionCoordinator,
        config: BridgeConfig,
        fault_sink: Arc<dyn FaultSink>,
    ) -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let state = Arc::new(DebugState::new(session, config, exits_tx));

        let gate = Arc::clone(&state);
        let mut dispatcher = Dispatcher::new(DapDialect)
            .with_fault_sink(fault_sink)
            .with_request_gate(move |command| gate.admit(command));
        register_all(&mut dispatcher, &state);

        Self {
            dispatcher,
            state,
            exits,
        }
    }

    /// Connection state shared with the handlers
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Serve until `disconnect`, peer disconnect, or a transport failure
    ///
    /// Returns whether the client ended the connection with `disconnect`.
    pub async fn serve(self, channel: TransportChannel) -> Result<bool, BridgeError> {
        let Self {
            dispatcher,
            state,
            exits,
        } = self;
        let forwarder = forward_session_events(
            state.session().subscribe(),
            exits,
            dispatcher.outbound(),
            Arc::clone(&state),
            dispatcher.stop_token(),
        );

        info!("Debug adapter listening");
        let result = dispatcher.serve(channel).await;
        forwarder.abort();
        result.map(|()| state.disconnected())
    }
}
