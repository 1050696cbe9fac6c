// ABOUTME: Outbound side of a connection: events, responses, and server-initiated requests
// ABOUTME: Tracks pending server-to-client requests until the matching response arrives
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::MessageSender;
use crate::message::{Message, RequestId, Response, ResponseError};
use crate::types::BridgeError;

type PendingReplies = HashMap<RequestId, oneshot::Sender<Result<Value, ResponseError>>>;

/// Cloneable handle used by handlers and forwarders to talk to the client
#[derive(Clone)]
pub struct Outbound {
    sender: MessageSender,
    pending: Arc<Mutex<PendingReplies>>,
}

impl Outbound {
    /// Wrap a message sender
    pub fn new(sender: MessageSender) -> Self {
        Self {
            sender,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue an event; write failures are logged by the writer
    pub fn send_event<T: Serialize>(&self, method: &str, params: &T) -> Result<(), BridgeError> {
        let params = serde_json::to_value(params)
            .map_err(|e| BridgeError::internal(format!("Failed to encode {method} params: {e}")))?;
        self.sender.send(Message::event(method, params))
    }

    /// Queue an already-built message
    pub(crate) fn send_message(&self, message: Message) -> Result<(), BridgeError> {
        self.sender.send(message)
    }

    /// Write a response and wait until it reached the transport
    pub async fn send_response(&self, response: Response) -> Result<(), BridgeError> {
        self.sender.send_confirmed(Message::Response(response)).await
    }

    /// Send a request to the client and wait for its response
    pub async fn send_request<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<Value, BridgeError> {
        let params = serde_json::to_value(params)
            .map_err(|e| BridgeError::internal(format!("Failed to encode {method} params: {e}")))?;
        let id = RequestId::Number(self.sender.next_sequence());
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);

        debug!(method, %id, "Sending request to client");
        if let Err(e) = self
            .sender
            .send_confirmed(Message::request(id.clone(), method, params))
            .await
        {
            self.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(BridgeError::collaborator(
                "client",
                format!("{method} failed: {error}"),
            )),
            Err(_) => Err(BridgeError::transport(format!(
                "Connection closed before {method} was answered"
            ))),
        }
    }

    /// Deliver a client response to the request awaiting it
    pub(crate) fn route_response(&self, response: Response) {
        let waiter = self.lock().remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response.outcome);
            }
            None => warn!(id = %response.id, "Dropping response to unknown request"),
        }
    }

    /// Fail every pending server-to-client request
    pub(crate) fn fail_pending(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (id, tx) in drained {
            debug!(%id, "Failing pending client request on shutdown");
            drop(tx);
        }
    }

    /// Number of server-to-client requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingReplies> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::codec::{channel, MessageReader};
    use crate::dialect::JsonRpcDialect;

    #[tokio::test]
    async fn client_response_resolves_server_request() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (sender, writer) = channel(server, Arc::new(JsonRpcDialect));
        let stop = CancellationToken::new();
        tokio::spawn(writer.run(stop.clone()));
        let outbound = Outbound::new(sender);

        let requester = outbound.clone();
        let call = tokio::spawn(async move {
            requester
                .send_request("window/showMessageRequest", &json!({"message": "hi"}))
                .await
        });

        let mut reader = MessageReader::new(client, Arc::new(JsonRpcDialect));
        let sent = reader
            .read_message()
            .await
            .expect("read")
            .expect("frame")
            .expect("decode");
        let Message::Request(req) = sent else {
            panic!("expected request");
        };
        assert_eq!(req.method, "window/showMessageRequest");

        outbound.route_response(Response {
            id: req.id,
            method: None,
            outcome: Ok(json!({"title": "OK"})),
        });
        let value = call.await.expect("join").expect("answered");
        assert_eq!(value["title"], "OK");
        assert_eq!(outbound.pending_requests(), 0);
        stop.cancel();
    }

    #[tokio::test]
    async fn pending_requests_fail_when_connection_stops() {
        let (_client, server) = tokio::io::duplex(16 * 1024);
        let (sender, writer) = channel(server, Arc::new(JsonRpcDialect));
        tokio::spawn(writer.run(CancellationToken::new()));
        let outbound = Outbound::new(sender);

        let requester = outbound.clone();
        let call = tokio::spawn(async move { requester.send_request("x", &json!({})).await });
        while outbound.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        outbound.fail_pending();

        let err = call.await.expect("join").expect_err("failed");
        assert!(err.is_fatal());
    }
}
