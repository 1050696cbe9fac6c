// ABOUTME: Shared error type for the bridge core and both protocol endpoints
// ABOUTME: Classifies failures so callers can tell fatal transport faults from recoverable ones
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Core Types
//!
//! Error classification used across the transport, dispatcher and session
//! layers. The kind decides how a failure propagates: transport faults tear
//! the connection down, framing faults skip one message, everything else is
//! surfaced to the caller that triggered it.

use std::fmt;

// ============================================================================
// Error Type
// ============================================================================

/// Error type for bridge operations
#[derive(Debug, Clone)]
pub struct BridgeError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// Categories of errors produced by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Internal error (bug, unexpected state)
    Internal,
    /// Connection-level I/O failure or corrupted framing header
    Transport,
    /// A single frame could not be decoded into a message
    Framing,
    /// The scripting engine reported a failure
    Engine,
    /// An external collaborator (analyzer, workspace) failed
    Collaborator,
    /// A referenced file or document does not exist
    NotFound,
    /// Configuration error
    Config,
}

impl BridgeError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: message.into(),
        }
    }

    /// Create a framing error for a single undecodable frame
    pub fn framing(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Framing,
            message: message.into(),
        }
    }

    /// Create an engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Engine,
            message: message.into(),
        }
    }

    /// Create a collaborator error, prefixed with the collaborator name
    pub fn collaborator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Collaborator,
            message: format!("{}: {}", name.into(), message.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: format!("Not found: {}", what.into()),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: message.into(),
        }
    }

    /// Whether this error ends the connection
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport)
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BridgeError {}
