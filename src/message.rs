// ABOUTME: Dialect-neutral message model shared by the LSP and DAP endpoints
// ABOUTME: Defines requests, responses, events, request ids, and protocol error codes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::BridgeError;

// ============================================================================
// Error Codes
// ============================================================================

/// Invalid JSON was received
pub const PARSE_ERROR: i64 = -32_700;

/// The message is not a valid request for the current state
pub const INVALID_REQUEST: i64 = -32_600;

/// No handler is registered for the method
pub const METHOD_NOT_FOUND: i64 = -32_601;

/// The parameters could not be decoded for the method
pub const INVALID_PARAMS: i64 = -32_602;

/// The handler failed or panicked
pub const INTERNAL_ERROR: i64 = -32_603;

/// A request arrived before `initialize` completed
pub const SERVER_NOT_INITIALIZED: i64 = -32_002;

/// The request was cancelled before it could complete
pub const REQUEST_CANCELLED: i64 = -32_800;

// ============================================================================
// Request Identifier
// ============================================================================

/// Request identifier, numeric or string as the wire allows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id (always used by DAP `seq`)
    Number(i64),
    /// String id (JSON-RPC only)
    String(String),
}

impl RequestId {
    /// Numeric view of the id, parsing string ids when they hold a number
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

// ============================================================================
// Response Error
// ============================================================================

/// Error payload carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Numeric error code
    pub code: i64,
    /// Human-readable error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Build an error with the given code and message
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Error for a method with no registered handler
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Error for parameters that failed to decode
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Error for a request that is not valid in the current state
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// Error for a failed or panicked handler
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Error for requests received before initialization
    pub fn not_initialized() -> Self {
        Self::new(SERVER_NOT_INITIALIZED, "Server has not been initialized")
    }

    /// Attach structured data to the error
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ResponseError {}

impl From<BridgeError> for ResponseError {
    fn from(err: BridgeError) -> Self {
        Self::internal(err.message)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A request expecting exactly one response
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Identifier echoed by the response
    pub id: RequestId,
    /// Method (LSP) or command (DAP) name
    pub method: String,
    /// Method parameters, `Null` when absent
    pub params: Value,
}

/// The answer to a request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request being answered
    pub id: RequestId,
    /// Method of the request, required by DAP and ignored by JSON-RPC
    pub method: Option<String>,
    /// Result payload or error
    pub outcome: Result<Value, ResponseError>,
}

/// A one-way notification
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event or notification name
    pub method: String,
    /// Event payload, `Null` when absent
    pub params: Value,
}

/// Any message carried on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response
    Request(Request),
    /// Response to an earlier request
    Response(Response),
    /// Notification or event
    Event(Event),
}

impl Message {
    /// Build a request message
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build an event message
    pub fn event(method: impl Into<String>, params: Value) -> Self {
        Self::Event(Event {
            method: method.into(),
            params,
        })
    }

    /// Build a successful response
    pub fn success(id: RequestId, method: Option<String>, result: Value) -> Self {
        Self::Response(Response {
            id,
            method,
            outcome: Ok(result),
        })
    }

    /// Build a failed response
    pub fn failure(id: RequestId, method: Option<String>, error: ResponseError) -> Self {
        Self::Response(Response {
            id,
            method,
            outcome: Err(error),
        })
    }

    /// Method name for requests and events, if known for responses
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Response(r) => r.method.as_deref(),
            Self::Event(e) => Some(&e.method),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_accepts_numbers_and_strings() {
        let num: RequestId = serde_json::from_str("7").expect("number id");
        let text: RequestId = serde_json::from_str("\"abc\"").expect("string id");
        assert_eq!(num, RequestId::Number(7));
        assert_eq!(text, RequestId::String("abc".to_owned()));
    }

    #[test]
    fn string_ids_expose_numeric_view_when_possible() {
        assert_eq!(RequestId::String("42".to_owned()).as_i64(), Some(42));
        assert_eq!(RequestId::String("x".to_owned()).as_i64(), None);
    }

    #[test]
    fn bridge_errors_become_internal_response_errors() {
        let err: ResponseError = BridgeError::engine("engine crashed").into();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert_eq!(err.message, "engine crashed");
    }

    #[test]
    fn method_not_found_names_the_method() {
        let err = ResponseError::method_not_found("textDocument/foo");
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert!(err.message.contains("textDocument/foo"));
    }
}
