// ABOUTME: Session coordinator serializing all engine access behind one execution worker
// ABOUTME: Pumps engine events in order, flushes buffered output, and settles pending requests
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Session Coordinator
//!
//! Every protocol handler that wants the engine to run something goes
//! through [`SessionCoordinator`]. Commands are queued and executed one at a
//! time by a single worker task. While the running top-level command is
//! suspended at a debugger stop, the worker keeps draining the queue and
//! runs those commands inside the engine's nested prompt, so an evaluation
//! issued while stopped completes instead of waiting behind the script.
//!
//! Engine events are consumed by a single pump task that owns the output
//! buffer. Output is coalesced and flushed either on a short deadline or
//! before any state-changing event, so a client always sees the output
//! produced before a stop ahead of the `stopped` notification. Execution
//! results are also routed through the pump, which makes "output before
//! completion" hold for every caller.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::breakpoints::{BreakpointMirror, EchoFilter};
use crate::dispatcher::{panic_message, Fault, FaultKind, FaultSink};
use crate::engine::{
    BreakpointChange, BreakpointInfo, CommandBreakpoint, EngineError, EngineErrorKind,
    EngineEvent, EngineEvents, EngineStatus, ExecutionOutput, ExecutionRequest, LineBreakpoint,
    ResumeAction, RunspaceInfo, ScopeInfo, ScriptingEngine, StackFrameInfo, StopDetails,
    VariableInfo,
};
use crate::message::RequestId;
use crate::output::{OutputBuffer, OutputChunk};
use crate::pending::{PendingKind, PendingTable, Settlement};
use crate::types::BridgeError;
use crate::workspace::is_executable_script;

// ============================================================================
// State and Events
// ============================================================================

/// Debugger sub-state while a script runs under the debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    /// Suspended in the nested prompt
    Stopped,
    /// Running again after a stop
    Resumed,
}

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Coordinator not yet started
    Uninitialized,
    /// Idle and accepting commands
    Ready,
    /// A top-level command is running
    Running,
    /// A top-level command is under debugger control
    Debugging(DebugState),
    /// Shutdown requested; no new top-level work starts
    ShuttingDown,
    /// The session is over
    Terminated,
}

impl SessionState {
    /// Whether a top-level command is in flight
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Running | Self::Debugging(_))
    }

    /// Whether the engine is suspended in the nested prompt
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Debugging(DebugState::Stopped))
    }
}

/// Outcome reported for top-level executions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// A top-level command started
    Running,
    /// The command finished successfully
    Completed,
    /// The command failed
    Failed,
    /// The command was aborted
    Aborted,
}

impl ExecutionStatus {
    /// Status name used on the wire
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Session-level notifications fanned out to every endpoint subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Buffered engine output
    Output(OutputChunk),
    /// The debugger stopped
    Stopped(StopDetails),
    /// The debugger resumed
    Resumed(ResumeAction),
    /// The active runspace changed
    RunspaceChanged(RunspaceInfo),
    /// A breakpoint changed outside a set-breakpoints call
    BreakpointChanged {
        /// Kind of change
        change: BreakpointChange,
        /// Breakpoint after the change
        breakpoint: BreakpointInfo,
    },
    /// A top-level execution changed status
    Execution(ExecutionStatus),
    /// The session ended and will not run anything else
    Terminated {
        /// Why the session ended
        reason: String,
    },
}

// ============================================================================
// Internals
// ============================================================================

type ExecutionReply = oneshot::Sender<Result<ExecutionOutput, EngineError>>;

struct QueuedExecution {
    /// Position in enqueue order
    seq: u64,
    request: ExecutionRequest,
    reply: ExecutionReply,
}

/// Work routed through the event pump so it is ordered after engine output
enum Notice {
    Completed {
        reply: ExecutionReply,
        result: Result<ExecutionOutput, EngineError>,
        /// Present for top-level commands; fired once the pump has published completion
        settled: Option<oneshot::Sender<()>>,
    },
    EchoWindowClosed,
    Terminate {
        reason: String,
    },
}

struct Inner {
    engine: Arc<dyn ScriptingEngine>,
    state: watch::Sender<SessionState>,
    queue: mpsc::UnboundedSender<QueuedExecution>,
    /// Next queue position; held while sending so positions follow channel order
    next_seq: Mutex<u64>,
    /// Queued commands below this position are discarded instead of run
    discard_before: Mutex<u64>,
    /// Number of commands the worker has taken off the queue
    dequeued: watch::Sender<u64>,
    notices: mpsc::UnboundedSender<Notice>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    pending: PendingTable,
    breakpoints: Mutex<BreakpointMirror>,
    echoes: Mutex<EchoFilter>,
    fault_sink: Arc<dyn FaultSink>,
    shutdown: CancellationToken,
    flush_interval: Duration,
}

/// Holds engine breakpoint events for the duration of one set-breakpoints
/// call; dropping it unfinished records the call as having changed nothing
struct EchoSuppression<'a> {
    inner: &'a Inner,
    finished: bool,
}

impl<'a> EchoSuppression<'a> {
    fn begin(inner: &'a Inner) -> Self {
        inner.echo_filter().begin();
        Self {
            inner,
            finished: false,
        }
    }

    fn finish(mut self, removed: &[BreakpointInfo], created: &[BreakpointInfo]) {
        self.inner.echo_filter().finish(removed, created);
        self.finished = true;
    }
}

impl Drop for EchoSuppression<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.echo_filter().abandon();
        }
        // The pump releases whatever was held once it sees this
        let _ = self.inner.notices.send(Notice::EchoWindowClosed);
    }
}

impl Inner {
    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the session already ended or is shutting down
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                SessionState::Terminated => false,
                SessionState::ShuttingDown => next == SessionState::Terminated,
                other => other != next,
            };
            if allowed {
                trace!(from = ?*current, to = ?next, "Session state transition");
                *current = next;
            }
            allowed
        })
    }

    fn publish(&self, event: SessionEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn notify(&self, notice: Notice) {
        if let Err(mpsc::error::SendError(notice)) = self.notices.send(notice) {
            // Pump is gone; resolve what can still be resolved
            match notice {
                Notice::Completed { reply, result, .. } => {
                    let _ = reply.send(result);
                }
                Notice::Terminate { reason } => self.terminate_now(&reason),
                Notice::EchoWindowClosed => {}
            }
        }
    }

    fn flush(&self, buffer: &mut OutputBuffer) {
        for chunk in buffer.drain() {
            self.publish(SessionEvent::Output(chunk));
        }
    }

    fn mirror(&self) -> MutexGuard<'_, BreakpointMirror> {
        self.breakpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn echo_filter(&self) -> MutexGuard<'_, EchoFilter> {
        self.echoes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cutoff(&self) -> MutexGuard<'_, u64> {
        self.discard_before
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `job` as taken off the queue; fails it if a disconnect cut it off
    fn take(&self, job: QueuedExecution, cutoff: u64) -> Option<QueuedExecution> {
        self.dequeued.send_modify(|n| *n = (*n).max(job.seq + 1));
        if job.seq >= cutoff {
            return Some(job);
        }
        debug!(command = job.request.label(), "Discarding command queued before disconnect");
        let _ = job
            .reply
            .send(Err(EngineError::aborted("Discarded by disconnect")));
        None
    }

    fn terminate_now(&self, reason: &str) {
        let changed = self.state.send_if_modified(|current| {
            if *current == SessionState::Terminated {
                false
            } else {
                *current = SessionState::Terminated;
                true
            }
        });
        if !changed {
            return;
        }
        info!(reason, "Session terminated");
        self.publish(SessionEvent::Terminated {
            reason: reason.to_owned(),
        });
        let drained = self.pending.drain(Settlement::Terminated);
        if drained > 0 {
            debug!(drained, "Resolved pending requests on termination");
        }
        self.shutdown.cancel();
    }

    /// Terminate when an engine error says the engine is gone
    fn observe<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if e.is_unusable() {
                self.notify(Notice::Terminate {
                    reason: e.message.clone(),
                });
            }
        }
        result
    }

    fn finish(
        &self,
        reply: ExecutionReply,
        result: Result<ExecutionOutput, EngineError>,
        top_level: bool,
    ) -> Option<oneshot::Receiver<()>> {
        let terminate = match &result {
            Err(e) if e.is_unusable() => Some(e.message.clone()),
            _ => None,
        };
        let (settled, ack) = if top_level {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.notify(Notice::Completed {
            reply,
            result,
            settled,
        });
        if let Some(reason) = terminate {
            self.notify(Notice::Terminate { reason });
        }
        ack
    }

    /// Wait until nothing runs and every command queued below `cutoff` is gone
    async fn settle(&self, cutoff: u64) -> Settlement {
        let mut state_rx = self.state.subscribe();
        let mut dequeued_rx = self.dequeued.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if state == SessionState::Terminated {
                return Settlement::Terminated;
            }
            if !state.is_busy() && *dequeued_rx.borrow_and_update() >= cutoff {
                return Settlement::Settled;
            }
            let changed = tokio::select! {
                changed = state_rx.changed() => changed,
                changed = dequeued_rx.changed() => changed,
            };
            if changed.is_err() {
                return Settlement::Terminated;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Execution worker
    // ------------------------------------------------------------------------

    async fn run_worker(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<QueuedExecution>) {
        let mut state_rx = self.state.subscribe();
        loop {
            let job = tokio::select! {
                () = self.shutdown.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run_top_level(job, &mut queue, &mut state_rx).await;
        }

        queue.close();
        while let Ok(job) = queue.try_recv() {
            let _ = job
                .reply
                .send(Err(EngineError::unusable("Session has terminated")));
        }
        debug!("Execution worker stopped");
    }

    async fn run_top_level(
        &self,
        job: QueuedExecution,
        queue: &mut mpsc::UnboundedReceiver<QueuedExecution>,
        state_rx: &mut watch::Receiver<SessionState>,
    ) {
        let Some(QueuedExecution { request, reply, .. }) = self.admit(job) else {
            return;
        };

        let engine = Arc::clone(&self.engine);
        let mut top = std::pin::pin!(async move { engine.execute(request).await });

        let result = loop {
            let nested_allowed = state_rx.borrow_and_update().is_stopped();
            tokio::select! {
                result = &mut top => break result,
                Some(nested) = queue.recv(), if nested_allowed => {
                    let cutoff = *self.cutoff();
                    if let Some(nested) = self.take(nested, cutoff) {
                        self.run_nested(nested).await;
                    }
                }
                Ok(()) = state_rx.changed() => {}
                () = self.shutdown.cancelled() => {
                    break Err(EngineError::aborted("Session terminated during execution"));
                }
            }
        };

        // The next command must not report Running before this one reports completion
        if let Some(ack) = self.finish(reply, result, true) {
            let _ = ack.await;
        }
    }

    /// Start a top-level command unless it was discarded or the session is closing
    ///
    /// The discard check and the move to `Running` happen under the cutoff
    /// lock, so a disconnect either sees this command running or discards it.
    fn admit(&self, job: QueuedExecution) -> Option<QueuedExecution> {
        let cutoff = self.cutoff();
        let job = self.take(job, *cutoff)?;
        if matches!(
            self.current_state(),
            SessionState::Terminated | SessionState::ShuttingDown
        ) {
            let _ = job
                .reply
                .send(Err(EngineError::unusable("Session is shutting down")));
            return None;
        }

        // Published before the engine can raise any event for this command
        debug!(command = job.request.label(), "Starting top-level execution");
        self.transition(SessionState::Running);
        self.publish(SessionEvent::Execution(ExecutionStatus::Running));
        drop(cutoff);
        Some(job)
    }

    async fn run_nested(&self, job: QueuedExecution) {
        debug!(command = job.request.label(), "Running command in nested prompt");
        let result = self.engine.execute(job.request).await;
        let _ = self.finish(job.reply, result, false);
    }

    // ------------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------------

    async fn run_event_pump(
        self: Arc<Self>,
        mut events: EngineEvents,
        mut notices: mpsc::UnboundedReceiver<Notice>,
    ) {
        let mut buffer = OutputBuffer::default();
        let mut engine_open = true;

        loop {
            let deadline = buffer.deadline(self.flush_interval);
            tokio::select! {
                biased;
                event = events.recv(), if engine_open => match event {
                    Some(event) => self.on_engine_event(event, &mut buffer),
                    None => {
                        engine_open = false;
                        self.flush(&mut buffer);
                        self.notify(Notice::Terminate {
                            reason: "Engine event stream closed".to_owned(),
                        });
                    }
                },
                notice = notices.recv() => match notice {
                    Some(notice) => {
                        if self.on_notice(notice, &mut buffer) {
                            break;
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(&mut buffer);
                }
            }
        }

        self.flush(&mut buffer);
        while let Ok(notice) = notices.try_recv() {
            if let Notice::Completed { reply, result, .. } = notice {
                let _ = reply.send(result);
            }
        }
        debug!("Event pump stopped");
    }

    fn on_engine_event(&self, event: EngineEvent, buffer: &mut OutputBuffer) {
        match event {
            EngineEvent::OutputWritten { category, text } => buffer.push(category, &text),
            EngineEvent::DebuggerStopped(details) => {
                self.flush(buffer);
                self.transition(SessionState::Debugging(DebugState::Stopped));
                debug!(reason = details.reason.as_protocol(), "Debugger stopped");
                self.publish(SessionEvent::Stopped(details));
            }
            EngineEvent::DebuggerResumed(action) => {
                self.flush(buffer);
                if self.current_state().is_busy() {
                    self.transition(SessionState::Debugging(DebugState::Resumed));
                }
                self.publish(SessionEvent::Resumed(action));
            }
            EngineEvent::RunspaceChanged(runspace) => {
                self.flush(buffer);
                debug!(runspace = %runspace.name, "Runspace changed");
                self.publish(SessionEvent::RunspaceChanged(runspace));
            }
            EngineEvent::BreakpointUpdated { change, breakpoint } => {
                self.echo_filter().push(change, breakpoint);
                self.release_breakpoint_changes();
            }
        }
    }

    fn release_breakpoint_changes(&self) {
        let released = self.echo_filter().release();
        for (change, breakpoint) in released {
            trace!(?change, id = ?breakpoint.id, "Breakpoint changed outside a set call");
            self.mirror().apply(change, &breakpoint);
            self.publish(SessionEvent::BreakpointChanged { change, breakpoint });
        }
    }

    /// Returns true when the pump should stop
    fn on_notice(&self, notice: Notice, buffer: &mut OutputBuffer) -> bool {
        match notice {
            Notice::Completed {
                reply,
                result,
                settled,
            } => {
                self.flush(buffer);
                if let Some(settled) = settled {
                    let status = match &result {
                        Ok(_) => ExecutionStatus::Completed,
                        Err(e) if e.kind == EngineErrorKind::Aborted => ExecutionStatus::Aborted,
                        Err(_) => ExecutionStatus::Failed,
                    };
                    self.transition(SessionState::Ready);
                    self.publish(SessionEvent::Execution(status));
                    let _ = settled.send(());
                }
                let _ = reply.send(result);
            }
            Notice::EchoWindowClosed => self.release_breakpoint_changes(),
            Notice::Terminate { reason } => {
                self.flush(buffer);
                self.terminate_now(&reason);
                return true;
            }
        }
        false
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Single choke point for engine access and engine event fan-out
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Subscribe to the engine and start the worker and event pump
    pub fn start(
        engine: Arc<dyn ScriptingEngine>,
        flush_interval: Duration,
        fault_sink: Arc<dyn FaultSink>,
    ) -> Result<Self, BridgeError> {
        let events = engine.subscribe().map_err(|e| {
            BridgeError::engine(format!("Failed to subscribe to engine events: {e}"))
        })?;

        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            engine,
            state,
            queue: queue_tx,
            next_seq: Mutex::new(0),
            discard_before: Mutex::new(0),
            dequeued: watch::channel(0).0,
            notices: notice_tx,
            subscribers: Mutex::new(Vec::new()),
            pending: PendingTable::default(),
            breakpoints: Mutex::new(BreakpointMirror::default()),
            echoes: Mutex::new(EchoFilter::default()),
            fault_sink,
            shutdown: CancellationToken::new(),
            flush_interval,
        });

        tokio::spawn(Arc::clone(&inner).run_worker(queue_rx));
        tokio::spawn(Arc::clone(&inner).run_event_pump(events, notice_rx));
        inner.transition(SessionState::Ready);

        info!(engine = inner.engine.name(), "Session coordinator started");
        Ok(Self { inner })
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Independent stream of session events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Token cancelled when the session terminates
    pub fn terminated(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Fault sink shared with continuations
    pub fn fault_sink(&self) -> Arc<dyn FaultSink> {
        Arc::clone(&self.inner.fault_sink)
    }

    fn enqueue(
        &self,
        request: ExecutionRequest,
    ) -> Result<oneshot::Receiver<Result<ExecutionOutput, EngineError>>, EngineError> {
        if self.state() == SessionState::Terminated {
            return Err(EngineError::unusable("Session has terminated"));
        }
        let (reply, rx) = oneshot::channel();
        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;
        self.inner
            .queue
            .send(QueuedExecution {
                seq,
                request,
                reply,
            })
            .map_err(|_| EngineError::unusable("Execution worker has stopped"))?;
        *next_seq += 1;
        Ok(rx)
    }

    async fn await_reply(
        rx: oneshot::Receiver<Result<ExecutionOutput, EngineError>>,
    ) -> Result<ExecutionOutput, EngineError> {
        rx.await
            .map_err(|_| EngineError::aborted("Execution was dropped before completing"))?
    }

    /// Queue a command and wait for its result
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, EngineError> {
        let rx = self.enqueue(request)?;
        Self::await_reply(rx).await
    }

    /// Queue a command and give up waiting after `timeout`
    ///
    /// The command itself keeps its place in the queue.
    pub async fn execute_with_timeout(
        &self,
        request: ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionOutput, EngineError> {
        let rx = self.enqueue(request)?;
        tokio::time::timeout(timeout, Self::await_reply(rx))
            .await
            .map_err(|_| EngineError::timeout(format!("No result within {timeout:?}")))?
    }

    /// Queue a command and return immediately
    ///
    /// The continuation runs once the command finishes. Its errors and panics
    /// are reported to the fault sink and never propagate.
    pub fn execute_detached<F, Fut>(&self, request: ExecutionRequest, continuation: F)
    where
        F: FnOnce(Result<ExecutionOutput, EngineError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let label = request.label().to_owned();
        let queued = self.enqueue(request);
        let sink = Arc::clone(&self.inner.fault_sink);

        tokio::spawn(async move {
            let result = match queued {
                Ok(rx) => Self::await_reply(rx).await,
                Err(e) => Err(e),
            };
            match AssertUnwindSafe(async move { continuation(result).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    sink.report(Fault::new(FaultKind::Continuation, Some(&label), e.message));
                }
                Err(payload) => {
                    sink.report(Fault::new(
                        FaultKind::Panic,
                        Some(&label),
                        panic_message(payload.as_ref()),
                    ));
                }
            }
        });
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.state() == SessionState::Terminated {
            Err(EngineError::unusable("Session has terminated"))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Direct debugger controls (bypass the queue)
    // ------------------------------------------------------------------------

    /// Break into the debugger
    pub async fn break_execution(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.inner
            .observe(self.inner.engine.break_execution().await)
    }

    /// Resume from the nested prompt
    pub async fn resume(&self, action: ResumeAction) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.inner.observe(self.inner.engine.resume(action).await)
    }

    /// Abort the running command
    pub async fn abort(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.inner.observe(self.inner.engine.abort().await)
    }

    /// Stack of the stopped script
    pub async fn stack_trace(&self) -> Result<Vec<StackFrameInfo>, EngineError> {
        self.ensure_live()?;
        self.inner.observe(self.inner.engine.stack_trace().await)
    }

    /// Scopes of a frame
    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>, EngineError> {
        self.ensure_live()?;
        self.inner.observe(self.inner.engine.scopes(frame_id).await)
    }

    /// Variables of a container
    pub async fn variables(&self, reference: i64) -> Result<Vec<VariableInfo>, EngineError> {
        self.ensure_live()?;
        self.inner.observe(self.inner.engine.variables(reference).await)
    }

    /// Assign a variable
    pub async fn set_variable(
        &self,
        reference: i64,
        name: &str,
        value: &str,
    ) -> Result<VariableInfo, EngineError> {
        self.ensure_live()?;
        self.inner
            .observe(self.inner.engine.set_variable(reference, name, value).await)
    }

    // ------------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------------

    /// Replace the line breakpoints of a script
    ///
    /// Never fails: a missing file, a non-script file, or an engine fault
    /// yields unverified breakpoints carrying the reason.
    pub async fn set_line_breakpoints(
        &self,
        script: &Path,
        requested: &[LineBreakpoint],
    ) -> Vec<BreakpointInfo> {
        let unverified = |reason: &str| -> Vec<BreakpointInfo> {
            requested
                .iter()
                .map(|bp| BreakpointInfo::unverified_line(script, bp, reason))
                .collect()
        };

        if !script.is_file() {
            return unverified(&format!(
                "Source file could not be accessed: {}",
                script.display()
            ));
        }
        if !is_executable_script(script) {
            return unverified("Breakpoints can only be set on script files (.ps1, .psm1)");
        }
        if let Err(e) = self.ensure_live() {
            return unverified(&e.message);
        }

        let prior = self.inner.mirror().lines_for(script).to_vec();
        let suppress = EchoSuppression::begin(&self.inner);
        let result = self
            .inner
            .engine
            .set_line_breakpoints(script, requested)
            .await;

        match self.inner.observe(result) {
            Ok(breakpoints) => {
                // Mirror first, so changes released after the call apply on top
                self.inner.mirror().replace_lines(script, breakpoints.clone());
                suppress.finish(&prior, &breakpoints);
                breakpoints
            }
            Err(e) => {
                warn!(script = %script.display(), error = %e, "Engine rejected line breakpoints");
                unverified(&e.message)
            }
        }
    }

    /// Replace all command breakpoints
    pub async fn set_command_breakpoints(
        &self,
        requested: &[CommandBreakpoint],
    ) -> Vec<BreakpointInfo> {
        let unverified = |reason: &str| -> Vec<BreakpointInfo> {
            requested
                .iter()
                .map(|bp| BreakpointInfo::unverified_command(bp, reason))
                .collect()
        };

        if let Err(e) = self.ensure_live() {
            return unverified(&e.message);
        }

        let prior = self.inner.mirror().commands().to_vec();
        let suppress = EchoSuppression::begin(&self.inner);
        let result = self.inner.engine.set_command_breakpoints(requested).await;

        match self.inner.observe(result) {
            Ok(breakpoints) => {
                self.inner.mirror().replace_commands(breakpoints.clone());
                suppress.finish(&prior, &breakpoints);
                breakpoints
            }
            Err(e) => {
                warn!(error = %e, "Engine rejected command breakpoints");
                unverified(&e.message)
            }
        }
    }

    /// Line breakpoints currently held for a script
    pub fn line_breakpoints(&self, script: &Path) -> Vec<BreakpointInfo> {
        self.inner.mirror().lines_for(script).to_vec()
    }

    /// Total number of breakpoints held
    pub fn breakpoint_count(&self) -> usize {
        self.inner.mirror().len()
    }

    // ------------------------------------------------------------------------
    // Disconnect and shutdown
    // ------------------------------------------------------------------------

    /// Abort any running command, discard queued ones, and wait until the
    /// session settles
    ///
    /// Only one disconnect may wait at a time; a second is rejected.
    pub async fn disconnect(&self, id: RequestId) -> Result<Settlement, BridgeError> {
        let waiter = self
            .inner
            .pending
            .register(id.clone(), PendingKind::Disconnect)?;

        let (cutoff, busy) = {
            let mut discard_before = self.inner.cutoff();
            *discard_before = *self
                .inner
                .next_seq
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (*discard_before, self.state().is_busy())
        };

        if busy || self.inner.engine.status() == EngineStatus::Busy {
            info!(%id, "Disconnect while running, aborting engine");
            if let Err(e) = self.inner.observe(self.inner.engine.abort().await) {
                warn!(error = %e, "Abort during disconnect failed");
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let settlement = inner.settle(cutoff).await;
            inner.pending.fulfill(&id, settlement);
        });

        waiter
            .await
            .map_err(|_| BridgeError::internal("Disconnect waiter was dropped"))
    }

    /// Number of requests waiting for the session to settle
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop accepting new top-level work
    pub fn shutdown(&self) {
        if self.inner.transition(SessionState::ShuttingDown) {
            info!("Session shutting down");
        }
    }

    /// End the session after flushing pending output
    pub fn terminate(&self, reason: &str) {
        self.inner.notify(Notice::Terminate {
            reason: reason.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::dispatcher::LogFaultSink;
    use crate::engine::{OutputCategory, StopReason};
    use crate::testing::{RecordingFaultSink, ScriptedEngine, Step};

    const FLUSH: Duration = Duration::from_millis(5);

    fn start(engine: &ScriptedEngine) -> SessionCoordinator {
        SessionCoordinator::start(Arc::new(engine.clone()), FLUSH, Arc::new(LogFaultSink))
            .expect("start session")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timely event")
            .expect("event")
    }

    async fn wait_for_state(session: &SessionCoordinator, wanted: SessionState) {
        let mut rx = session.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("timely state")
            .expect("state channel");
    }

    #[tokio::test]
    async fn execute_returns_engine_output_and_returns_to_ready() {
        let engine = ScriptedEngine::new().with_script("1 + 1", vec![Step::Return(vec!["2".to_owned()])]);
        let session = start(&engine);

        let output = session
            .execute(ExecutionRequest::command("1 + 1"))
            .await
            .expect("executed");
        assert_eq!(output.lines, vec!["2"]);
        wait_for_state(&session, SessionState::Ready).await;
    }

    #[tokio::test]
    async fn commands_run_one_at_a_time_in_queue_order() {
        let engine = ScriptedEngine::new()
            .with_script("first", vec![Step::Delay(Duration::from_millis(50))])
            .with_script("second", vec![]);
        let session = start(&engine);

        let a = session.clone();
        let first = tokio::spawn(async move { a.execute(ExecutionRequest::command("first")).await });
        while engine.executed().is_empty() {
            tokio::task::yield_now().await;
        }
        session
            .execute(ExecutionRequest::command("second"))
            .await
            .expect("second");
        first.await.expect("join").expect("first");

        assert_eq!(engine.executed(), vec!["first", "second"]);
        assert_eq!(engine.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn output_before_stop_is_flushed_before_stopped_event() {
        let engine = ScriptedEngine::new().with_script(
            "script",
            vec![
                Step::Output(OutputCategory::Stdout, "line one\n".to_owned()),
                Step::Output(OutputCategory::Stdout, "line two\n".to_owned()),
                Step::Stop(StopDetails::new(StopReason::Breakpoint)),
            ],
        );
        // A long flush interval proves the stop forces the flush
        let session =
            SessionCoordinator::start(Arc::new(engine.clone()), Duration::from_secs(60), Arc::new(LogFaultSink))
                .expect("start");
        let mut events = session.subscribe();

        session.execute_detached(ExecutionRequest::command("script"), |_| async { Ok(()) });

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Execution(ExecutionStatus::Running)
        );
        match next_event(&mut events).await {
            SessionEvent::Output(chunk) => assert_eq!(chunk.text, "line one\nline two\n"),
            other => panic!("expected output, got {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, SessionEvent::Stopped(_)));
        assert!(session.state().is_stopped());
    }

    #[tokio::test]
    async fn command_queued_while_stopped_runs_in_nested_prompt() {
        let engine = ScriptedEngine::new()
            .with_script("script", vec![Step::Stop(StopDetails::new(StopReason::Breakpoint))])
            .with_script("$x", vec![Step::Return(vec!["42".to_owned()])]);
        let session = start(&engine);
        let mut events = session.subscribe();

        session.execute_detached(ExecutionRequest::command("script"), |_| async { Ok(()) });
        loop {
            if let SessionEvent::Stopped(_) = next_event(&mut events).await {
                break;
            }
        }

        let value = tokio::time::timeout(
            Duration::from_secs(5),
            session.execute(ExecutionRequest::command("$x")),
        )
        .await
        .expect("nested command must not deadlock")
        .expect("evaluated");
        assert_eq!(value.lines, vec!["42"]);
        assert!(session.state().is_stopped());

        session.resume(ResumeAction::Continue).await.expect("resume");
        wait_for_state(&session, SessionState::Ready).await;
    }

    #[tokio::test]
    async fn commands_queued_while_running_wait_for_completion() {
        let engine = ScriptedEngine::new()
            .with_script("long", vec![Step::Delay(Duration::from_millis(100))])
            .with_script("after", vec![]);
        let session = start(&engine);

        session.execute_detached(ExecutionRequest::command("long"), |_| async { Ok(()) });
        while engine.executed().is_empty() {
            tokio::task::yield_now().await;
        }
        session
            .execute(ExecutionRequest::command("after"))
            .await
            .expect("after");
        assert_eq!(engine.executed(), vec!["long", "after"]);
        assert_eq!(engine.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn detached_continuation_runs_after_output_is_flushed() {
        let engine = ScriptedEngine::new().with_script(
            "say",
            vec![Step::Output(OutputCategory::Stdout, "hello\n".to_owned())],
        );
        let session =
            SessionCoordinator::start(Arc::new(engine.clone()), Duration::from_secs(60), Arc::new(LogFaultSink))
                .expect("start");
        let mut events = session.subscribe();
        let (done_tx, done_rx) = oneshot::channel();

        session.execute_detached(ExecutionRequest::command("say"), move |result| async move {
            let _ = done_tx.send(result.is_ok());
            Ok(())
        });

        assert!(done_rx.await.expect("continuation ran"));
        let mut saw_output = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Output(_)) {
                saw_output = true;
            }
        }
        assert!(saw_output, "output must be published before completion");
    }

    #[tokio::test]
    async fn failing_continuation_is_reported_not_propagated() {
        let engine = ScriptedEngine::new();
        let sink = Arc::new(RecordingFaultSink::default());
        let session = SessionCoordinator::start(
            Arc::new(engine.clone()),
            FLUSH,
            Arc::clone(&sink) as Arc<dyn FaultSink>,
        )
        .expect("start");

        session.execute_detached(ExecutionRequest::command("x"), |_| async {
            Err(BridgeError::internal("continuation failed"))
        });
        session.execute_detached(ExecutionRequest::command("y"), |_| async {
            if true {
                panic!("continuation panicked");
            }
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.faults().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both faults reported");
        let kinds: Vec<_> = sink.faults().iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FaultKind::Continuation));
        assert!(kinds.contains(&FaultKind::Panic));

        // Session still usable afterwards
        session
            .execute(ExecutionRequest::command("z"))
            .await
            .expect("still usable");
    }

    #[tokio::test]
    async fn breakpoints_on_missing_file_are_unverified_with_reason() {
        let engine = ScriptedEngine::new();
        let session = start(&engine);
        let requested = vec![LineBreakpoint {
            line: 3,
            ..LineBreakpoint::default()
        }];

        let result = session
            .set_line_breakpoints(Path::new("/definitely/missing/script.ps1"), &requested)
            .await;
        assert_eq!(result.len(), 1);
        assert!(!result[0].verified);
        assert!(result[0].message.as_deref().is_some_and(|m| !m.is_empty()));
        assert_eq!(engine.breakpoint_calls(), 0);
    }

    #[tokio::test]
    async fn breakpoints_on_non_script_file_are_unverified() {
        let engine = ScriptedEngine::new();
        let session = start(&engine);
        let mut file = tempfile::Builder::new()
            .suffix(".txt")
            .tempfile()
            .expect("temp file");
        writeln!(file, "not a script").expect("write");

        let result = session
            .set_line_breakpoints(
                file.path(),
                &[LineBreakpoint {
                    line: 1,
                    ..LineBreakpoint::default()
                }],
            )
            .await;
        assert!(!result[0].verified);
        assert!(result[0]
            .message
            .as_deref()
            .is_some_and(|m| m.contains(".ps1")));
    }

    #[tokio::test]
    async fn engine_breakpoint_fault_degrades_to_unverified() {
        let engine = ScriptedEngine::new();
        engine.fail_breakpoints(EngineError::fault("runspace busy"));
        let session = start(&engine);
        let file = tempfile::Builder::new()
            .suffix(".ps1")
            .tempfile()
            .expect("temp file");

        let result = session
            .set_line_breakpoints(
                file.path(),
                &[LineBreakpoint {
                    line: 2,
                    ..LineBreakpoint::default()
                }],
            )
            .await;
        assert!(!result[0].verified);
        assert_eq!(result[0].message.as_deref(), Some("runspace busy"));
        assert_ne!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn breakpoint_echoes_are_suppressed_during_set_breakpoints() {
        let engine = ScriptedEngine::new();
        let session = start(&engine);
        let mut events = session.subscribe();
        let file = tempfile::Builder::new()
            .suffix(".ps1")
            .tempfile()
            .expect("temp file");

        let result = session
            .set_line_breakpoints(
                file.path(),
                &[LineBreakpoint {
                    line: 5,
                    ..LineBreakpoint::default()
                }],
            )
            .await;
        assert!(result[0].verified);
        assert_eq!(session.line_breakpoints(file.path()).len(), 1);

        // An out-of-band change is still forwarded
        engine.emit(EngineEvent::BreakpointUpdated {
            change: BreakpointChange::Removed,
            breakpoint: result[0].clone(),
        });
        match next_event(&mut events).await {
            SessionEvent::BreakpointChanged { change, .. } => {
                assert_eq!(change, BreakpointChange::Removed);
            }
            other => panic!("expected only the out-of-band change, got {other:?}"),
        }
        assert_eq!(session.breakpoint_count(), 0);
    }

    #[tokio::test]
    async fn replacing_breakpoints_publishes_no_echoes() {
        let engine = ScriptedEngine::new();
        let session = start(&engine);
        let mut events = session.subscribe();
        let file = tempfile::Builder::new()
            .suffix(".ps1")
            .tempfile()
            .expect("temp file");
        let line = |line| LineBreakpoint {
            line,
            ..LineBreakpoint::default()
        };

        session.set_line_breakpoints(file.path(), &[line(1)]).await;
        let replaced = session
            .set_line_breakpoints(file.path(), &[line(2), line(3)])
            .await;
        assert_eq!(session.line_breakpoints(file.path()), replaced);

        // A marker change raised afterwards must be the first thing delivered
        let marker = BreakpointInfo {
            id: Some(99),
            verified: true,
            command: Some("Get-Item".to_owned()),
            ..BreakpointInfo::default()
        };
        engine.emit(EngineEvent::BreakpointUpdated {
            change: BreakpointChange::Added,
            breakpoint: marker.clone(),
        });
        match next_event(&mut events).await {
            SessionEvent::BreakpointChanged { breakpoint, .. } => assert_eq!(breakpoint, marker),
            other => panic!("expected the marker change, got {other:?}"),
        }
        assert_eq!(session.breakpoint_count(), 3);
    }

    #[tokio::test]
    async fn break_reaches_the_engine_while_a_command_runs() {
        let engine = ScriptedEngine::new().with_script("forever", vec![Step::Hang]);
        let session = start(&engine);
        session.execute_detached(ExecutionRequest::command("forever"), |_| async { Ok(()) });
        wait_for_state(&session, SessionState::Running).await;

        tokio::time::timeout(Duration::from_secs(5), session.break_execution())
            .await
            .expect("break is not queued behind the command")
            .expect("break accepted");
        assert_eq!(engine.pause_count(), 1);
        assert!(session.state().is_busy());
    }

    #[tokio::test]
    async fn disconnect_discards_commands_queued_behind_the_running_one() {
        let engine = ScriptedEngine::new().with_script("forever", vec![Step::Hang]);
        let session = start(&engine);
        session.execute_detached(ExecutionRequest::command("forever"), |_| async { Ok(()) });
        wait_for_state(&session, SessionState::Running).await;

        let (queued_tx, queued_rx) = oneshot::channel();
        session.execute_detached(ExecutionRequest::command("queued"), move |result| async move {
            let _ = queued_tx.send(result);
            Ok(())
        });

        let settlement = tokio::time::timeout(
            Duration::from_secs(5),
            session.disconnect(RequestId::Number(4)),
        )
        .await
        .expect("disconnect settles")
        .expect("disconnect accepted");
        assert_eq!(settlement, Settlement::Settled);

        let queued = queued_rx.await.expect("queued command resolved");
        assert_eq!(
            queued.expect_err("discarded").kind,
            EngineErrorKind::Aborted
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.state().is_busy());
        assert_eq!(engine.executed(), vec!["forever"]);

        // Work submitted after the disconnect still runs
        session
            .execute(ExecutionRequest::command("later"))
            .await
            .expect("later runs");
        assert_eq!(engine.executed(), vec!["forever", "later"]);
    }

    #[tokio::test]
    async fn disconnect_waits_until_running_command_settles() {
        let engine = ScriptedEngine::new().with_script("forever", vec![Step::Hang]);
        let session = start(&engine);

        session.execute_detached(ExecutionRequest::command("forever"), |_| async { Ok(()) });
        wait_for_state(&session, SessionState::Running).await;

        let settlement = tokio::time::timeout(
            Duration::from_secs(5),
            session.disconnect(RequestId::Number(10)),
        )
        .await
        .expect("disconnect settles")
        .expect("disconnect accepted");
        assert_eq!(settlement, Settlement::Settled);
        assert_eq!(engine.abort_count(), 1);
        assert!(!session.state().is_busy());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn second_concurrent_disconnect_is_rejected() {
        let engine = ScriptedEngine::new().with_script("forever", vec![Step::Hang]);
        engine.ignore_aborts();
        let session = start(&engine);
        session.execute_detached(ExecutionRequest::command("forever"), |_| async { Ok(()) });
        wait_for_state(&session, SessionState::Running).await;

        let first = session.clone();
        let waiting = tokio::spawn(async move { first.disconnect(RequestId::Number(1)).await });
        while session.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        let err = session
            .disconnect(RequestId::Number(2))
            .await
            .expect_err("second disconnect");
        assert!(err.message.contains("already in progress"));

        session.terminate("test over");
        let settlement = waiting.await.expect("join").expect("first resolved");
        assert_eq!(settlement, Settlement::Terminated);
    }

    #[tokio::test]
    async fn unusable_engine_terminates_session() {
        let engine = ScriptedEngine::new().with_script(
            "crash",
            vec![Step::Fail(EngineError::unusable("runspace broken"))],
        );
        let session = start(&engine);
        let mut events = session.subscribe();

        let err = session
            .execute(ExecutionRequest::command("crash"))
            .await
            .expect_err("crashed");
        assert!(err.is_unusable());

        loop {
            if let SessionEvent::Terminated { reason } = next_event(&mut events).await {
                assert_eq!(reason, "runspace broken");
                break;
            }
        }
        assert_eq!(session.state(), SessionState::Terminated);
        let after = session
            .execute(ExecutionRequest::command("1"))
            .await
            .expect_err("terminated");
        assert!(after.is_unusable());
    }

    #[tokio::test]
    async fn shutdown_blocks_new_top_level_work() {
        let engine = ScriptedEngine::new();
        let session = start(&engine);
        session.shutdown();
        assert_eq!(session.state(), SessionState::ShuttingDown);

        let err = session
            .execute(ExecutionRequest::command("Get-Date"))
            .await
            .expect_err("shutting down");
        assert!(err.is_unusable());
        assert!(engine.executed().is_empty());
    }
}
