// ABOUTME: Content-Length framing for inbound and outbound protocol messages
// ABOUTME: Lazy frame reader plus a single writer task that never interleaves frames
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Framing
//!
//! Both endpoints speak the same framing: a `Content-Length` header block
//! terminated by an empty line, followed by exactly that many bytes of UTF-8
//! JSON. Reading is sequential and lazy; writing goes through one task that
//! owns the output half so concurrent senders can never interleave bytes.
//!
//! Failure classes:
//! - a body that is not valid JSON, or not a valid envelope, is a
//!   [`ErrorKind::Framing`](crate::types::ErrorKind::Framing) error and only
//!   that frame is lost
//! - a missing or corrupt header, or EOF inside a frame, is a
//!   [`ErrorKind::Transport`](crate::types::ErrorKind::Transport) error and
//!   ends the stream

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dialect::WireDialect;
use crate::message::Message;
use crate::types::BridgeError;

/// Largest frame body accepted from a peer (64 MiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length";

// ============================================================================
// Reader
// ============================================================================

/// Reads framed messages from the input half of a transport
pub struct MessageReader<R> {
    reader: BufReader<R>,
    dialect: Arc<dyn WireDialect>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Create a reader decoding frames with the given dialect
    pub fn new(reader: R, dialect: Arc<dyn WireDialect>) -> Self {
        Self {
            reader: BufReader::new(reader),
            dialect,
        }
    }

    /// Read one raw frame body
    ///
    /// Returns `Ok(None)` on a clean end of input between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;
        let mut line = String::new();

        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| BridgeError::transport(format!("Failed to read header: {e}")))?;

            if read == 0 {
                if saw_header {
                    return Err(BridgeError::transport("Unexpected end of input in header"));
                }
                return Ok(None);
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                if saw_header {
                    break;
                }
                // Tolerate stray blank lines between frames
                continue;
            }
            saw_header = true;

            let (name, value) = trimmed
                .split_once(':')
                .ok_or_else(|| BridgeError::transport(format!("Malformed header: {trimmed}")))?;

            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let length = value.trim().parse::<usize>().map_err(|e| {
                    BridgeError::transport(format!("Invalid Content-Length '{}': {e}", value.trim()))
                })?;
                content_length = Some(length);
            } else {
                trace!(header = name.trim(), "Ignoring header");
            }
        }

        let length = content_length
            .ok_or_else(|| BridgeError::transport("Frame is missing Content-Length header"))?;
        if length > MAX_FRAME_BYTES {
            return Err(BridgeError::transport(format!(
                "Frame of {length} bytes exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| BridgeError::transport(format!("Failed to read frame body: {e}")))?;

        Ok(Some(body))
    }

    /// Read and decode one message
    ///
    /// The outer result is fatal; the inner result reports a frame that was
    /// read completely but could not be decoded.
    pub async fn read_message(&mut self) -> Result<Option<Result<Message, BridgeError>>, BridgeError> {
        let Some(body) = self.read_frame().await? else {
            return Ok(None);
        };
        Ok(Some(self.decode(&body)))
    }

    fn decode(&self, body: &[u8]) -> Result<Message, BridgeError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| BridgeError::framing(format!("Invalid JSON body: {e}")))?;
        self.dialect.decode(value)
    }

    /// Turn the reader into a lazy stream of messages
    ///
    /// Framing errors are yielded and the stream continues. A transport
    /// error is yielded once and then the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, BridgeError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.read_message().await {
                Ok(Some(item)) => Some((item, Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

// ============================================================================
// Writer
// ============================================================================

/// One queued outbound message with an optional write acknowledgement
struct Outgoing {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), BridgeError>>>,
}

/// Cloneable handle for queueing outbound messages
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Outgoing>,
    sequence: Arc<AtomicI64>,
}

impl MessageSender {
    /// Queue a message without waiting for it to be written
    ///
    /// Fails only when the writer has already shut down.
    pub fn send(&self, message: Message) -> Result<(), BridgeError> {
        self.tx
            .send(Outgoing { message, ack: None })
            .map_err(|_| BridgeError::transport("Writer has shut down"))
    }

    /// Queue a message and wait until it has been written and flushed
    pub async fn send_confirmed(&self, message: Message) -> Result<(), BridgeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outgoing {
                message,
                ack: Some(ack_tx),
            })
            .map_err(|_| BridgeError::transport("Writer has shut down"))?;
        ack_rx
            .await
            .map_err(|_| BridgeError::transport("Writer stopped before the message was written"))?
    }

    /// Draw the next value from the shared outbound sequence
    pub fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Owns the output half and writes queued frames one at a time
pub struct MessageWriter<W> {
    writer: W,
    dialect: Arc<dyn WireDialect>,
    rx: mpsc::UnboundedReceiver<Outgoing>,
    sequence: Arc<AtomicI64>,
}

/// Create a sender/writer pair over the given output half
pub fn channel<W>(writer: W, dialect: Arc<dyn WireDialect>) -> (MessageSender, MessageWriter<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, pending) = detached_channel();
    (sender, pending.attach(writer, dialect))
}

/// Sender whose writer half is attached later, once the transport is open
pub struct PendingWriter {
    rx: mpsc::UnboundedReceiver<Outgoing>,
    sequence: Arc<AtomicI64>,
}

impl PendingWriter {
    /// Bind the queue to an output half
    pub fn attach<W>(self, writer: W, dialect: Arc<dyn WireDialect>) -> MessageWriter<W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        MessageWriter {
            writer,
            dialect,
            rx: self.rx,
            sequence: self.sequence,
        }
    }
}

/// Create a sender before the output half exists
pub fn detached_channel() -> (MessageSender, PendingWriter) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sequence = Arc::new(AtomicI64::new(1));
    (
        MessageSender {
            tx,
            sequence: Arc::clone(&sequence),
        },
        PendingWriter { rx, sequence },
    )
}

/// Prepend the `Content-Length` header to a body
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Write queued frames until every sender is dropped or `stop` fires
    ///
    /// On stop, frames already queued are still written before returning.
    pub async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                item = self.rx.recv() => match item {
                    Some(outgoing) => self.write_one(outgoing).await,
                    None => break,
                },
                () = stop.cancelled() => {
                    while let Ok(outgoing) = self.rx.try_recv() {
                        self.write_one(outgoing).await;
                    }
                    break;
                }
            }
        }
        let _ = self.writer.shutdown().await;
        debug!(dialect = self.dialect.name(), "Message writer stopped");
    }

    async fn write_one(&mut self, outgoing: Outgoing) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let result = self.write_message(&outgoing.message, seq).await;

        match outgoing.ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(
                        method = outgoing.message.method().unwrap_or_default(),
                        error = %e,
                        "Dropped outbound message after write failure"
                    );
                }
            }
        }
    }

    async fn write_message(&mut self, message: &Message, seq: i64) -> Result<(), BridgeError> {
        let value = self.dialect.encode(message, seq);
        let body = serde_json::to_vec(&value)
            .map_err(|e| BridgeError::internal(format!("JSON serialization failed: {e}")))?;
        let frame = encode_frame(&body);

        self.writer
            .write_all(&frame)
            .await
            .map_err(|e| BridgeError::transport(format!("Write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| BridgeError::transport(format!("Flush failed: {e}")))?;

        trace!(seq, bytes = body.len(), "Wrote frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::dialect::JsonRpcDialect;
    use crate::message::RequestId;
    use crate::types::ErrorKind;

    fn frame(body: &str) -> Vec<u8> {
        encode_frame(body.as_bytes())
    }

    fn reader_over(bytes: Vec<u8>) -> MessageReader<std::io::Cursor<Vec<u8>>> {
        MessageReader::new(std::io::Cursor::new(bytes), Arc::new(JsonRpcDialect))
    }

    #[tokio::test]
    async fn reads_consecutive_frames_and_ends_cleanly() {
        let mut bytes = frame(r#"{"jsonrpc":"2.0","id":1,"method":"a"}"#);
        bytes.extend(frame(r#"{"jsonrpc":"2.0","method":"b"}"#));

        let messages: Vec<_> = reader_over(bytes).into_stream().collect().await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], Ok(Message::Request(r)) if r.id == RequestId::Number(1)));
        assert!(matches!(&messages[1], Ok(Message::Event(e)) if e.method == "b"));
    }

    #[tokio::test]
    async fn malformed_body_is_skipped_and_next_frame_still_read() {
        let mut bytes = frame("{not json");
        bytes.extend(frame(r#"{"jsonrpc":"2.0","method":"after"}"#));

        let messages: Vec<_> = reader_over(bytes).into_stream().collect().await;
        assert_eq!(messages.len(), 2);
        let first = messages[0].as_ref().expect_err("bad body");
        assert_eq!(first.kind, ErrorKind::Framing);
        assert!(matches!(&messages[1], Ok(Message::Event(e)) if e.method == "after"));
    }

    #[tokio::test]
    async fn extra_headers_are_ignored() {
        let body = r#"{"jsonrpc":"2.0","method":"x"}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = reader_over(raw.into_bytes());
        let msg = reader.read_message().await.expect("read").expect("frame");
        assert!(msg.is_ok());
    }

    #[tokio::test]
    async fn missing_content_length_is_fatal() {
        let raw = b"X-Other: 1\r\n\r\n{}".to_vec();
        let messages: Vec<_> = reader_over(raw).into_stream().collect().await;
        assert_eq!(messages.len(), 1);
        let err = messages[0].as_ref().expect_err("fatal");
        assert_eq!(err.kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn truncated_body_is_fatal() {
        let raw = b"Content-Length: 50\r\n\r\n{\"jsonrpc\":".to_vec();
        let mut reader = reader_over(raw);
        let err = reader.read_message().await.expect_err("truncated");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1).into_bytes();
        let err = reader_over(raw).read_frame().await.expect_err("too large");
        assert!(err.message.contains("exceeds limit"));
    }

    #[tokio::test]
    async fn writer_emits_whole_frames_in_queue_order() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (sender, writer) = channel(server, Arc::new(JsonRpcDialect));
        let stop = CancellationToken::new();
        let task = tokio::spawn(writer.run(stop.clone()));

        for i in 0..20 {
            sender
                .send(Message::event("tick", json!({ "n": i })))
                .expect("queue");
        }
        sender
            .send_confirmed(Message::success(RequestId::Number(1), None, json!(true)))
            .await
            .expect("confirmed write");
        stop.cancel();
        task.await.expect("writer task");

        let mut buf = Vec::new();
        let mut client = client;
        client.read_to_end(&mut buf).await.expect("drain");
        let mut reader = reader_over(buf);

        for i in 0..20 {
            let msg = reader.read_message().await.expect("read").expect("frame").expect("decode");
            match msg {
                Message::Event(e) => assert_eq!(e.params["n"], i),
                other => panic!("unexpected: {other:?}"),
            }
        }
        let last = reader.read_message().await.expect("read").expect("frame").expect("decode");
        assert!(matches!(last, Message::Response(_)));
    }

    #[tokio::test]
    async fn confirmed_send_fails_after_writer_stops() {
        let (sender, pending) = detached_channel();
        drop(pending);
        let err = sender
            .send_confirmed(Message::event("x", json!(null)))
            .await
            .expect_err("no writer");
        assert_eq!(err.kind, ErrorKind::Transport);
    }
}
