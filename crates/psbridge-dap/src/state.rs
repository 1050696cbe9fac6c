// ABOUTME: Per-connection debug adapter state: launch gate, termination latch, and collaborators
// ABOUTME: The launch gate starts execution exactly once, after both launch and configurationDone
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use psbridge::engine::ExecutionRequest;
use psbridge::{BridgeConfig, ResponseError, SessionCoordinator};
use tokio::sync::mpsc;
use tracing::debug;

/// Type alias for the state handle shared by every handler
pub type SharedState = Arc<DebugState>;

/// How the debuggee is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// A script or inline command run by the adapter
    Launch,
    /// A runspace in another process or computer
    Attach,
}

/// What runs once configuration is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Launch or attach
    pub kind: LaunchKind,
    /// Command to run; `None` keeps an interactive session without a debuggee
    pub request: Option<ExecutionRequest>,
}

/// Ordering of `launch`/`attach` against `configurationDone`
///
/// Every arrival performs one transition under one lock, so exactly one of
/// the two requests sees both halves and starts execution.
#[derive(Debug, Default)]
pub enum LaunchGate {
    /// Neither request has arrived
    #[default]
    AwaitingBoth,
    /// `launch` or `attach` arrived first
    Planned(LaunchPlan),
    /// `configurationDone` arrived first
    Configured,
    /// Execution was handed out
    Started,
}

impl LaunchGate {
    /// Record a launch plan; returns it when configuration was already done
    pub fn plan(&mut self, plan: LaunchPlan) -> Result<Option<LaunchPlan>, ResponseError> {
        match self {
            Self::AwaitingBoth => {
                *self = Self::Planned(plan);
                Ok(None)
            }
            Self::Configured => {
                *self = Self::Started;
                Ok(Some(plan))
            }
            Self::Planned(_) | Self::Started => Err(ResponseError::invalid_request(
                "A launch or attach request was already received",
            )),
        }
    }

    /// Record `configurationDone`; returns the plan when it arrived first
    pub fn configuration_done(&mut self) -> Option<LaunchPlan> {
        match std::mem::take(self) {
            Self::AwaitingBoth => {
                *self = Self::Configured;
                None
            }
            Self::Planned(plan) => {
                *self = Self::Started;
                Some(plan)
            }
            other => {
                debug!(gate = ?other, "Repeated configurationDone ignored");
                *self = other;
                None
            }
        }
    }
}

/// Why the debuggee stopped running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggeeExit {
    /// Failure message when the debuggee ended with an error
    pub error: Option<String>,
}

/// State of one debug adapter connection
pub struct DebugState {
    session: SessionCoordinator,
    config: BridgeConfig,
    initialized: AtomicBool,
    gate: Mutex<LaunchGate>,
    terminated_sent: AtomicBool,
    disconnected: AtomicBool,
    exits: mpsc::UnboundedSender<DebuggeeExit>,
}

impl DebugState {
    /// State for a fresh connection; debuggee exits are reported on `exits`
    pub fn new(
        session: SessionCoordinator,
        config: BridgeConfig,
        exits: mpsc::UnboundedSender<DebuggeeExit>,
    ) -> Self {
        Self {
            session,
            config,
            initialized: AtomicBool::new(false),
            gate: Mutex::new(LaunchGate::default()),
            terminated_sent: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            exits,
        }
    }

    /// Shared engine session
    pub const fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    /// Timeouts and delays
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Request gate run by the dispatcher before any handler
    pub fn admit(&self, method: &str) -> Result<(), ResponseError> {
        if method == "initialize" {
            if self.initialized.swap(true, Ordering::SeqCst) {
                return Err(ResponseError::invalid_request(
                    "Debug adapter is already initialized",
                ));
            }
            return Ok(());
        }
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResponseError::invalid_request(format!(
                "'{method}' received before initialize"
            )))
        }
    }

    /// Feed `launch` or `attach` into the gate
    pub fn plan(&self, plan: LaunchPlan) -> Result<Option<LaunchPlan>, ResponseError> {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plan(plan)
    }

    /// Feed `configurationDone` into the gate
    pub fn configuration_done(&self) -> Option<LaunchPlan> {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .configuration_done()
    }

    /// Report that the debuggee finished
    pub fn debuggee_exited(&self, exit: DebuggeeExit) {
        if self.exits.send(exit).is_err() {
            debug!("Debuggee exit after the connection closed");
        }
    }

    /// Latch the `terminated` event; true only the first time
    pub fn claim_terminated(&self) -> bool {
        !self.terminated_sent.swap(true, Ordering::SeqCst)
    }

    /// Record a client disconnect
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Whether the client ended the connection with `disconnect`
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}
