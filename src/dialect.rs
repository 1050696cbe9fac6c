// ABOUTME: Wire dialects mapping JSON envelopes to the shared message model
// ABOUTME: Implements JSON-RPC 2.0 (LSP) and the seq/type envelope used by DAP
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use serde_json::{json, Map, Value};

use crate::message::{Event, Message, Request, RequestId, Response, ResponseError, INTERNAL_ERROR};
use crate::types::BridgeError;

/// Encoding and decoding between JSON envelopes and [`Message`]
///
/// `seq` is the per-connection outbound counter assigned by the writer at
/// write time. Dialects without sequence numbers ignore it.
pub trait WireDialect: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Decode one JSON body into a message
    fn decode(&self, value: Value) -> Result<Message, BridgeError>;

    /// Encode a message for the wire
    fn encode(&self, message: &Message, seq: i64) -> Value;
}

fn take_object(value: Value) -> Result<Map<String, Value>, BridgeError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(BridgeError::framing(format!(
            "Expected a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

const fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

// ============================================================================
// JSON-RPC 2.0
// ============================================================================

/// JSON-RPC 2.0 envelope used by the language server
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcDialect;

impl WireDialect for JsonRpcDialect {
    fn name(&self) -> &'static str {
        "jsonrpc"
    }

    fn decode(&self, value: Value) -> Result<Message, BridgeError> {
        let mut map = take_object(value)?;

        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|e| BridgeError::framing(format!("Invalid request id: {e}")))?,
            ),
        };
        let params = map.remove("params").unwrap_or(Value::Null);

        match (take_string(&mut map, "method"), id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request { id, method, params })),
            (Some(method), None) => Ok(Message::Event(Event { method, params })),
            (None, Some(id)) => {
                let outcome = match map.remove("error") {
                    Some(err) => Err(serde_json::from_value::<ResponseError>(err)
                        .map_err(|e| BridgeError::framing(format!("Invalid error object: {e}")))?),
                    None => Ok(map.remove("result").unwrap_or(Value::Null)),
                };
                Ok(Message::Response(Response {
                    id,
                    method: None,
                    outcome,
                }))
            }
            (None, None) => Err(BridgeError::framing(
                "Message has neither a method nor an id",
            )),
        }
    }

    fn encode(&self, message: &Message, _seq: i64) -> Value {
        match message {
            Message::Request(req) => {
                let mut body = json!({
                    "jsonrpc": "2.0",
                    "id": req.id,
                    "method": req.method,
                });
                if !req.params.is_null() {
                    body["params"] = req.params.clone();
                }
                body
            }
            Message::Response(resp) => match &resp.outcome {
                Ok(result) => json!({
                    "jsonrpc": "2.0",
                    "id": resp.id,
                    "result": result,
                }),
                Err(error) => json!({
                    "jsonrpc": "2.0",
                    "id": resp.id,
                    "error": error,
                }),
            },
            Message::Event(evt) => {
                let mut body = json!({
                    "jsonrpc": "2.0",
                    "method": evt.method,
                });
                if !evt.params.is_null() {
                    body["params"] = evt.params.clone();
                }
                body
            }
        }
    }
}

// ============================================================================
// Debug Adapter Protocol
// ============================================================================

/// DAP envelope (`seq`/`type`/`command`) used by the debug adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct DapDialect;

impl WireDialect for DapDialect {
    fn name(&self) -> &'static str {
        "dap"
    }

    fn decode(&self, value: Value) -> Result<Message, BridgeError> {
        let mut map = take_object(value)?;
        let kind = take_string(&mut map, "type")
            .ok_or_else(|| BridgeError::framing("DAP message is missing 'type'"))?;

        match kind.as_str() {
            "request" => {
                let seq = map
                    .get("seq")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| BridgeError::framing("DAP request is missing 'seq'"))?;
                let command = take_string(&mut map, "command")
                    .ok_or_else(|| BridgeError::framing("DAP request is missing 'command'"))?;
                Ok(Message::Request(Request {
                    id: RequestId::Number(seq),
                    method: command,
                    params: map.remove("arguments").unwrap_or(Value::Null),
                }))
            }
            "response" => {
                let request_seq = map
                    .get("request_seq")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| BridgeError::framing("DAP response is missing 'request_seq'"))?;
                let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
                let command = take_string(&mut map, "command");
                let body = map.remove("body").unwrap_or(Value::Null);
                let outcome = if success {
                    Ok(body)
                } else {
                    let message = take_string(&mut map, "message")
                        .unwrap_or_else(|| "request failed".to_owned());
                    Err(ResponseError::new(INTERNAL_ERROR, message).with_data(body))
                };
                Ok(Message::Response(Response {
                    id: RequestId::Number(request_seq),
                    method: command,
                    outcome,
                }))
            }
            "event" => {
                let event = take_string(&mut map, "event")
                    .ok_or_else(|| BridgeError::framing("DAP event is missing 'event'"))?;
                Ok(Message::Event(Event {
                    method: event,
                    params: map.remove("body").unwrap_or(Value::Null),
                }))
            }
            other => Err(BridgeError::framing(format!(
                "Unknown DAP message type: {other}"
            ))),
        }
    }

    fn encode(&self, message: &Message, seq: i64) -> Value {
        match message {
            // Reverse requests carry their own seq so the client's request_seq matches the id
            Message::Request(req) => json!({
                "seq": req.id.as_i64().unwrap_or(seq),
                "type": "request",
                "command": req.method,
                "arguments": req.params,
            }),
            Message::Response(resp) => {
                let mut body = json!({
                    "seq": seq,
                    "type": "response",
                    "request_seq": resp.id.as_i64().unwrap_or_default(),
                    "command": resp.method.as_deref().unwrap_or_default(),
                });
                match &resp.outcome {
                    Ok(result) => {
                        body["success"] = Value::Bool(true);
                        if !result.is_null() {
                            body["body"] = result.clone();
                        }
                    }
                    Err(error) => {
                        body["success"] = Value::Bool(false);
                        body["message"] = Value::String(error.message.clone());
                        body["body"] = json!({
                            "error": {
                                "id": error.code,
                                "format": error.message,
                                "showUser": true,
                            }
                        });
                    }
                }
                body
            }
            Message::Event(evt) => {
                let mut body = json!({
                    "seq": seq,
                    "type": "event",
                    "event": evt.method,
                });
                if !evt.params.is_null() {
                    body["body"] = evt.params.clone();
                }
                body
            }
        }
    }
}
