// ABOUTME: Per-message handles given to request and event handlers
// ABOUTME: Expose the message identity, outbound events, and connection shutdown
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::{Message, RequestId};
use crate::outbound::Outbound;
use crate::types::BridgeError;

/// Handle bound to one inbound request
///
/// The response itself is produced from the handler's return value, so a
/// context cannot answer twice. Events queued with
/// [`send_event_after_response`](Self::send_event_after_response) are written
/// right after that response.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    method: Arc<str>,
    outbound: Outbound,
    stop: CancellationToken,
    deferred: Arc<Mutex<Vec<Message>>>,
    shutdown_after_response: Arc<AtomicBool>,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        method: &str,
        outbound: Outbound,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            method: Arc::from(method),
            outbound,
            stop,
            deferred: Arc::new(Mutex::new(Vec::new())),
            shutdown_after_response: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identifier of the request being handled
    pub const fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// Method or command name of the request
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Send an event immediately, ahead of the response
    pub fn send_event<T: Serialize>(&self, method: &str, params: &T) -> Result<(), BridgeError> {
        self.outbound.send_event(method, params)
    }

    /// Queue an event that is written once the response has been written
    pub fn send_event_after_response<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<(), BridgeError> {
        let params = serde_json::to_value(params)
            .map_err(|e| BridgeError::internal(format!("Failed to encode {method} params: {e}")))?;
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Message::event(method, params));
        Ok(())
    }

    /// Send a request to the client and await its answer
    pub async fn send_request<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<Value, BridgeError> {
        self.outbound.send_request(method, params).await
    }

    /// Stop the dispatcher once this request's response has been written
    pub fn shutdown_after_response(&self) {
        self.shutdown_after_response.store(true, Ordering::SeqCst);
    }

    /// Outbound handle for work that outlives this request
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Resolves when the connection is stopping
    pub fn stopping(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn take_deferred(&self) -> Vec<Message> {
        std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn wants_shutdown(&self) -> bool {
        self.shutdown_after_response.load(Ordering::SeqCst)
    }
}

/// Handle bound to one inbound event
#[derive(Clone)]
pub struct EventContext {
    method: Arc<str>,
    outbound: Outbound,
    stop: CancellationToken,
}

impl EventContext {
    pub(crate) fn new(method: &str, outbound: Outbound, stop: CancellationToken) -> Self {
        Self {
            method: Arc::from(method),
            outbound,
            stop,
        }
    }

    /// Event name
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Send an event to the client
    pub fn send_event<T: Serialize>(&self, method: &str, params: &T) -> Result<(), BridgeError> {
        self.outbound.send_event(method, params)
    }

    /// Outbound handle for work that outlives this event
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Stop the dispatcher; queued output is still written
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}
