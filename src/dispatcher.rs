// ABOUTME: Method-keyed dispatcher turning a framed transport into typed handler calls
// ABOUTME: Guarantees one response per request and routes handler faults to a fault sink
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Message Dispatcher
//!
//! Handlers are registered per method before the dispatcher runs. Once
//! [`Dispatcher::serve`] consumes the dispatcher the registry is frozen and
//! the dispatcher cannot be restarted.
//!
//! Messages are read one at a time. Every request handler and every
//! ordinary event handler runs in its own task, so a slow handler never
//! holds up the read loop. Ordered events (document synchronization) run to
//! completion on the read loop so their effects apply in arrival order.
//!
//! Every request gets exactly one response: the handler's return value, an
//! `InvalidParams` error when the params fail to decode, an internal error
//! when the handler panics, or `MethodNotFound` when nothing is registered.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{detached_channel, MessageReader, PendingWriter};
use crate::context::{EventContext, RequestContext};
use crate::dialect::WireDialect;
use crate::message::{Event, Message, Request, RequestId, Response, ResponseError};
use crate::outbound::Outbound;
use crate::transport::TransportChannel;
use crate::types::BridgeError;

// ============================================================================
// Fault Sink
// ============================================================================

/// Where an unhandled fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection-level I/O failure
    Transport,
    /// A frame that could not be decoded
    Framing,
    /// A request handler returned an error
    RequestHandler,
    /// An event handler returned an error
    EventHandler,
    /// A handler or continuation panicked
    Panic,
    /// A fire-and-continue continuation failed
    Continuation,
    /// The scripting engine failed outside any request
    Engine,
}

/// An unhandled fault reported to the process-wide sink
#[derive(Debug, Clone)]
pub struct Fault {
    /// Origin of the fault
    pub kind: FaultKind,
    /// Method being handled, when known
    pub method: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl Fault {
    /// Create a fault record
    pub fn new(kind: FaultKind, method: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            method: method.map(ToOwned::to_owned),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{:?} in {method}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Receives faults that no caller is positioned to handle
pub trait FaultSink: Send + Sync {
    /// Record a fault
    fn report(&self, fault: Fault);
}

/// Fault sink that writes to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, fault: Fault) {
        let method = fault.method.as_deref().unwrap_or("-");
        match fault.kind {
            FaultKind::Transport | FaultKind::Panic | FaultKind::Engine => {
                error!(kind = ?fault.kind, method, message = %fault.message, "Unhandled fault");
            }
            FaultKind::Framing
            | FaultKind::RequestHandler
            | FaultKind::EventHandler
            | FaultKind::Continuation => {
                warn!(kind = ?fault.kind, method, message = %fault.message, "Handler fault");
            }
        }
    }
}

/// Exit code when the connection ended cleanly
pub const EXIT_CLEAN: i32 = 0;
/// Exit code for an unclean lifecycle end or a handler panic
pub const EXIT_FAULT: i32 = 1;
/// Exit code for a transport failure
pub const EXIT_TRANSPORT: i32 = 2;

/// Logs like [`LogFaultSink`] and tallies the faults that decide the exit code
#[derive(Debug, Default)]
pub struct CountingFaultSink {
    panics: AtomicUsize,
    transport: AtomicUsize,
}

impl CountingFaultSink {
    /// Number of handler or continuation panics seen
    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::SeqCst)
    }

    /// Process exit code given whether the protocol lifecycle ended cleanly
    pub fn exit_code(&self, clean: bool) -> i32 {
        if self.transport.load(Ordering::SeqCst) > 0 {
            EXIT_TRANSPORT
        } else if self.panics() > 0 || !clean {
            EXIT_FAULT
        } else {
            EXIT_CLEAN
        }
    }
}

impl FaultSink for CountingFaultSink {
    fn report(&self, fault: Fault) {
        match fault.kind {
            FaultKind::Panic => {
                self.panics.fetch_add(1, Ordering::SeqCst);
            }
            FaultKind::Transport => {
                self.transport.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        LogFaultSink.report(fault);
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

// ============================================================================
// Method Registry
// ============================================================================

type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RequestFn =
    dyn Fn(RequestContext, Value) -> HandlerFuture<Result<Value, ResponseError>> + Send + Sync;
type EventFn = dyn Fn(EventContext, Value) -> HandlerFuture<Result<(), BridgeError>> + Send + Sync;
type GateFn = dyn Fn(&str) -> Result<(), ResponseError> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Request(Arc<RequestFn>),
    Event { ordered: bool, handler: Arc<EventFn> },
}

fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, serde_json::Error> {
    if params.is_null() {
        // Absent params decode as `()`/`Option` or as an empty object
        serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Map::new())))
    } else {
        serde_json::from_value(params)
    }
}

fn erase_event<P, F, Fut>(handler: F) -> Arc<EventFn>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(EventContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
{
    Arc::new(move |ctx: EventContext, params: Value| -> HandlerFuture<Result<(), BridgeError>> {
        match decode_params::<P>(params) {
            Ok(params) => Box::pin(handler(ctx, params)),
            Err(e) => Box::pin(std::future::ready(Err(BridgeError::framing(format!(
                "Invalid params for {}: {e}",
                ctx.method()
            ))))),
        }
    })
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound messages on one connection to registered handlers
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    dialect: Arc<dyn WireDialect>,
    outbound: Outbound,
    writer: PendingWriter,
    fault_sink: Arc<dyn FaultSink>,
    gate: Option<Arc<GateFn>>,
    stop: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher for the given wire dialect
    pub fn new(dialect: impl WireDialect) -> Self {
        let (sender, writer) = detached_channel();
        Self {
            handlers: HashMap::new(),
            dialect: Arc::new(dialect),
            outbound: Outbound::new(sender),
            writer,
            fault_sink: Arc::new(LogFaultSink),
            gate: None,
            stop: CancellationToken::new(),
        }
    }

    /// Check every inbound request before it reaches its handler
    ///
    /// The gate runs on the read loop in arrival order, so state it records
    /// is visible to the very next message. A rejection becomes the response.
    #[must_use]
    pub fn with_request_gate(
        mut self,
        gate: impl Fn(&str) -> Result<(), ResponseError> + Send + Sync + 'static,
    ) -> Self {
        self.gate = Some(Arc::new(gate));
        self
    }

    /// Replace the fault sink
    #[must_use]
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }

    /// Outbound handle, usable before the connection is served
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Token that stops the dispatcher when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// The fault sink handlers should share
    pub fn fault_sink(&self) -> Arc<dyn FaultSink> {
        Arc::clone(&self.fault_sink)
    }

    /// Whether a handler is registered for the method
    pub fn handles(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Register a request handler; a later registration for the same method wins
    pub fn on_request<P, R, F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ResponseError>> + Send + 'static,
    {
        let erased: Arc<RequestFn> = Arc::new(
            move |ctx: RequestContext,
                  params: Value|
                  -> HandlerFuture<Result<Value, ResponseError>> {
                match decode_params::<P>(params) {
                    Ok(params) => {
                        let fut = handler(ctx, params);
                        Box::pin(async move {
                            let result = fut.await?;
                            serde_json::to_value(result).map_err(|e| {
                                ResponseError::internal(format!("Failed to encode result: {e}"))
                            })
                        })
                    }
                    Err(e) => Box::pin(std::future::ready(Err(ResponseError::invalid_params(
                        format!("Invalid params: {e}"),
                    )))),
                }
            },
        );
        self.insert(method, Handler::Request(erased));
        self
    }

    /// Register an event handler that runs concurrently with other messages
    pub fn on_event<P, F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(EventContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let handler = erase_event(handler);
        self.insert(
            method,
            Handler::Event {
                ordered: false,
                handler,
            },
        );
        self
    }

    /// Register an event handler that completes before the next message is read
    ///
    /// Meant for cheap state updates whose order matters, such as document edits.
    pub fn on_ordered_event<P, F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(EventContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let handler = erase_event(handler);
        self.insert(
            method,
            Handler::Event {
                ordered: true,
                handler,
            },
        );
        self
    }

    fn insert(&mut self, method: &str, handler: Handler) {
        if self.handlers.insert(method.to_owned(), handler).is_some() {
            debug!(method, "Replaced existing handler registration");
        }
    }

    /// Run until the peer disconnects, a fatal transport error occurs, or stop fires
    ///
    /// In-flight handlers are not awaited; queued output is flushed before
    /// returning. Server-to-client requests still pending are failed.
    pub async fn serve(self, channel: TransportChannel) -> Result<(), BridgeError> {
        let Self {
            handlers,
            dialect,
            outbound,
            writer,
            fault_sink,
            gate,
            stop,
        } = self;

        let (reader, writer_half, _guard) = channel.into_parts();
        let writer_task = tokio::spawn(
            writer
                .attach(writer_half, Arc::clone(&dialect))
                .run(stop.clone()),
        );

        let connection = Connection {
            handlers: Arc::new(handlers),
            outbound: outbound.clone(),
            fault_sink: Arc::clone(&fault_sink),
            gate,
            stop: stop.clone(),
        };

        info!(
            dialect = dialect.name(),
            methods = connection.handlers.len(),
            "Dispatcher running"
        );

        let mut messages =
            std::pin::pin!(MessageReader::new(reader, Arc::clone(&dialect)).into_stream());
        let mut outcome = Ok(());

        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => {
                    debug!("Dispatcher stop requested");
                    break;
                }
                next = messages.next() => next,
            };

            match next {
                None => {
                    debug!("Peer closed the connection");
                    break;
                }
                Some(Ok(message)) => connection.dispatch(message).await,
                Some(Err(e)) if e.is_fatal() => {
                    fault_sink.report(Fault::new(FaultKind::Transport, None, e.message.clone()));
                    outcome = Err(e);
                    break;
                }
                Some(Err(e)) => {
                    fault_sink.report(Fault::new(FaultKind::Framing, None, e.message));
                }
            }
        }

        stop.cancel();
        outbound.fail_pending();
        if let Err(e) = writer_task.await {
            warn!(error = %e, "Writer task ended abnormally");
        }
        info!(dialect = dialect.name(), "Dispatcher stopped");
        outcome
    }
}

/// Shared per-connection routing state handed to handler tasks
#[derive(Clone)]
struct Connection {
    handlers: Arc<HashMap<String, Handler>>,
    outbound: Outbound,
    fault_sink: Arc<dyn FaultSink>,
    gate: Option<Arc<GateFn>>,
    stop: CancellationToken,
}

impl Connection {
    fn reject(&self, request: Request, error: ResponseError) {
        debug!(method = %request.method, id = %request.id, code = error.code, "Request rejected");
        let connection = self.clone();
        tokio::spawn(async move {
            connection
                .respond(request.id, request.method, Err(error))
                .await;
        });
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => {
                if let Some(Err(error)) = self.gate.as_ref().map(|gate| gate(&request.method)) {
                    self.reject(request, error);
                    return;
                }
                self.dispatch_request(request);
            }
            Message::Event(event) => match self.handlers.get(&event.method) {
                Some(Handler::Event { ordered, handler }) => {
                    let handler = Arc::clone(handler);
                    if *ordered {
                        self.run_event(handler, event).await;
                    } else {
                        let connection = self.clone();
                        tokio::spawn(async move { connection.run_event(handler, event).await });
                    }
                }
                Some(Handler::Request(_)) => {
                    warn!(method = %event.method, "Event sent for a request method, ignoring");
                }
                None => debug!(method = %event.method, "Ignoring unhandled event"),
            },
            Message::Response(response) => self.outbound.route_response(response),
        }
    }

    fn dispatch_request(&self, request: Request) {
        match self.handlers.get(&request.method) {
            Some(Handler::Request(handler)) => {
                let handler = Arc::clone(handler);
                let connection = self.clone();
                tokio::spawn(async move { connection.run_request(handler, request).await });
            }
            _ => {
                let error = ResponseError::method_not_found(&request.method);
                self.reject(request, error);
            }
        }
    }

    async fn run_request(self, handler: Arc<RequestFn>, request: Request) {
        let Request { id, method, params } = request;
        let ctx = RequestContext::new(id.clone(), &method, self.outbound.clone(), self.stop.clone());

        let call_ctx = ctx.clone();
        let outcome = match AssertUnwindSafe(async move { handler(call_ctx, params).await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.fault_sink
                    .report(Fault::new(FaultKind::Panic, Some(&method), message.clone()));
                Err(ResponseError::internal(format!(
                    "Handler for {method} panicked: {message}"
                )))
            }
        };

        if let Err(error) = &outcome {
            self.fault_sink.report(Fault::new(
                FaultKind::RequestHandler,
                Some(&method),
                error.to_string(),
            ));
        }

        self.respond(id, method, outcome).await;

        for message in ctx.take_deferred() {
            if let Err(e) = self.outbound.send_message(message) {
                debug!(error = %e, "Could not queue deferred event");
            }
        }
        if ctx.wants_shutdown() {
            self.stop.cancel();
        }
    }

    async fn respond(
        &self,
        id: RequestId,
        method: String,
        outcome: Result<Value, ResponseError>,
    ) {
        let response = Response {
            id,
            method: Some(method),
            outcome,
        };
        let id = response.id.clone();
        if let Err(e) = self.outbound.send_response(response).await {
            warn!(%id, error = %e, "Failed to write response");
        }
    }

    async fn run_event(&self, handler: Arc<EventFn>, event: Event) {
        let Event { method, params } = event;
        let ctx = EventContext::new(&method, self.outbound.clone(), self.stop.clone());

        match AssertUnwindSafe(async move { handler(ctx, params).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fault_sink
                    .report(Fault::new(FaultKind::EventHandler, Some(&method), e.message));
            }
            Err(payload) => {
                self.fault_sink.report(Fault::new(
                    FaultKind::Panic,
                    Some(&method),
                    panic_message(payload.as_ref()),
                ));
            }
        }
    }
}
