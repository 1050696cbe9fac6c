// ABOUTME: Per-connection language server state: lifecycle gate, collaborators, and diagnostics
// ABOUTME: The lifecycle gate answers requests sent before initialize or after shutdown
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::{Arc, Mutex, PoisonError};

use psbridge::analysis::Analyzer;
use psbridge::dispatcher::{EXIT_CLEAN, EXIT_FAULT};
use psbridge::symbols::SymbolProvider;
use psbridge::workspace::Workspace;
use psbridge::{BridgeConfig, ResponseError, SessionCoordinator};
use tracing::{debug, info};

use crate::diagnostics::DiagnosticsScheduler;

/// Type alias for the state handle shared by every handler
pub type SharedState = Arc<ServerState>;

/// Where the connection is in the LSP lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Waiting for `initialize`
    Uninitialized,
    /// Serving requests
    Ready,
    /// `shutdown` received; only `exit` remains
    ShuttingDown,
    /// `exit` received with the resulting process exit code
    Exited(i32),
}

/// Collaborators the language endpoint calls into
#[derive(Clone)]
pub struct LanguageServices {
    /// Shared engine session
    pub session: SessionCoordinator,
    /// Open-document store
    pub workspace: Arc<dyn Workspace>,
    /// Static analyzer and formatter
    pub analyzer: Arc<dyn Analyzer>,
    /// Symbol lookups
    pub symbols: Arc<dyn SymbolProvider>,
    /// Timeouts and delays
    pub config: BridgeConfig,
}

/// State of one language server connection
pub struct ServerState {
    lifecycle: Mutex<Lifecycle>,
    services: LanguageServices,
    diagnostics: DiagnosticsScheduler,
}

impl ServerState {
    /// State for a fresh connection
    pub fn new(services: LanguageServices, diagnostics: DiagnosticsScheduler) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            services,
            diagnostics,
        }
    }

    /// Collaborators
    pub const fn services(&self) -> &LanguageServices {
        &self.services
    }

    /// Diagnostics scheduler
    pub const fn diagnostics(&self) -> &DiagnosticsScheduler {
        &self.diagnostics
    }

    /// Current lifecycle phase
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether document and language traffic should be served
    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    /// Request gate run by the dispatcher before any handler
    ///
    /// `initialize` and `shutdown` move the lifecycle forward here, on the
    /// read loop, so the very next message already sees the new phase.
    pub fn admit(&self, method: &str) -> Result<(), ResponseError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match (*lifecycle, method) {
            (Lifecycle::Uninitialized, "initialize") => {
                *lifecycle = Lifecycle::Ready;
                Ok(())
            }
            (Lifecycle::Uninitialized, _) => Err(ResponseError::not_initialized()),
            (Lifecycle::Ready, "initialize") => Err(ResponseError::invalid_request(
                "Server is already initialized",
            )),
            (Lifecycle::Ready, "shutdown") => {
                *lifecycle = Lifecycle::ShuttingDown;
                Ok(())
            }
            (Lifecycle::Ready, _) => Ok(()),
            (Lifecycle::ShuttingDown | Lifecycle::Exited(_), _) => {
                debug!(method, "Request after shutdown");
                Err(ResponseError::invalid_request("Server is shutting down"))
            }
        }
    }

    /// Record `exit`; returns the process exit code
    pub fn exit(&self) -> i32 {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let code = match *lifecycle {
            Lifecycle::ShuttingDown => EXIT_CLEAN,
            Lifecycle::Exited(code) => code,
            Lifecycle::Uninitialized | Lifecycle::Ready => EXIT_FAULT,
        };
        *lifecycle = Lifecycle::Exited(code);
        info!(code, "Exit received");
        code
    }

    /// Whether the connection ended through `shutdown` then `exit`
    pub fn exited_cleanly(&self) -> bool {
        self.lifecycle() == Lifecycle::Exited(EXIT_CLEAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psbridge::message::{INVALID_REQUEST, SERVER_NOT_INITIALIZED};
    use psbridge::testing::{ScriptedEngine, StaticAnalyzer};
    use psbridge::workspace::InMemoryWorkspace;
    use psbridge::symbols::DeclarationSymbols;
    use psbridge::{Dispatcher, JsonRpcDialect, LogFaultSink};

    fn state() -> ServerState {
        let session = SessionCoordinator::start(
            Arc::new(ScriptedEngine::new()),
            std::time::Duration::from_millis(5),
            Arc::new(LogFaultSink),
        )
        .expect("session");
        let workspace: Arc<dyn Workspace> = Arc::new(InMemoryWorkspace::default());
        let analyzer: Arc<dyn Analyzer> = Arc::new(StaticAnalyzer::new("gci", "AvoidAlias"));
        let outbound = Dispatcher::new(JsonRpcDialect).outbound();
        let config = BridgeConfig::default();
        let diagnostics = DiagnosticsScheduler::new(
            Arc::clone(&workspace),
            Arc::clone(&analyzer),
            outbound,
            config.diagnostics_delay,
        );
        ServerState::new(
            LanguageServices {
                session,
                workspace,
                analyzer,
                symbols: Arc::new(DeclarationSymbols),
                config,
            },
            diagnostics,
        )
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let state = state();
        let err = state.admit("textDocument/hover").expect_err("gated");
        assert_eq!(err.code, SERVER_NOT_INITIALIZED);
        assert!(state.admit("initialize").is_ok());
        assert!(state.admit("textDocument/hover").is_ok());
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_invalid() {
        let state = state();
        state.admit("initialize").expect("init");
        state.admit("shutdown").expect("shutdown");
        let err = state.admit("textDocument/hover").expect_err("gated");
        assert_eq!(err.code, INVALID_REQUEST);
        assert_eq!(state.exit(), EXIT_CLEAN);
        assert!(state.exited_cleanly());
    }

    #[tokio::test]
    async fn exit_without_shutdown_is_a_fault() {
        let state = state();
        state.admit("initialize").expect("init");
        assert_eq!(state.exit(), EXIT_FAULT);
        assert!(!state.exited_cleanly());
    }

    #[tokio::test]
    async fn second_initialize_is_invalid() {
        let state = state();
        state.admit("initialize").expect("init");
        assert_eq!(
            state.admit("initialize").expect_err("twice").code,
            INVALID_REQUEST
        );
    }
}
