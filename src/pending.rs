// ABOUTME: Table of protocol requests waiting for the session to settle
// ABOUTME: Entries fire exactly once and are drained when the session terminates
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::message::RequestId;
use crate::types::BridgeError;

/// What a pending request is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// A disconnect waiting for the engine to stop running
    Disconnect,
    /// A request waiting for an execution to settle
    Execution,
}

/// How a pending request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The session reached a non-running state
    Settled,
    /// The session terminated while the request was waiting
    Terminated,
}

struct PendingEntry {
    kind: PendingKind,
    waiter: oneshot::Sender<Settlement>,
}

/// Request id to continuation map
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingTable {
    /// Register a waiter for a request id
    ///
    /// Rejects a duplicate id and a second concurrent disconnect.
    pub fn register(
        &self,
        id: RequestId,
        kind: PendingKind,
    ) -> Result<oneshot::Receiver<Settlement>, BridgeError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(BridgeError::internal(format!(
                "Request {id} is already pending"
            )));
        }
        if kind == PendingKind::Disconnect
            && entries.values().any(|e| e.kind == PendingKind::Disconnect)
        {
            return Err(BridgeError::internal("A disconnect is already in progress"));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id, PendingEntry { kind, waiter: tx });
        Ok(rx)
    }

    /// Resolve one entry; returns false when it was already resolved
    pub fn fulfill(&self, id: &RequestId, settlement: Settlement) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!(%id, ?settlement, "Pending request resolved");
                let _ = entry.waiter.send(settlement);
                true
            }
            None => false,
        }
    }

    /// Resolve every entry, returning how many fired
    pub fn drain(&self, settlement: Settlement) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.waiter.send(settlement);
        }
        count
    }

    /// Number of unresolved entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are waiting
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_fires_once() {
        let table = PendingTable::default();
        let rx = table
            .register(RequestId::Number(1), PendingKind::Execution)
            .expect("register");

        assert!(table.fulfill(&RequestId::Number(1), Settlement::Settled));
        assert!(!table.fulfill(&RequestId::Number(1), Settlement::Settled));
        assert_eq!(rx.await.expect("fired"), Settlement::Settled);
        assert!(table.is_empty());
    }

    #[test]
    fn second_disconnect_is_rejected() {
        let table = PendingTable::default();
        let _first = table
            .register(RequestId::Number(1), PendingKind::Disconnect)
            .expect("first");
        let err = table
            .register(RequestId::Number(2), PendingKind::Disconnect)
            .expect_err("second");
        assert!(err.message.contains("already in progress"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = PendingTable::default();
        let _first = table
            .register(RequestId::Number(3), PendingKind::Execution)
            .expect("first");
        assert!(table
            .register(RequestId::Number(3), PendingKind::Execution)
            .is_err());
    }

    #[tokio::test]
    async fn drain_resolves_everything_as_terminated() {
        let table = PendingTable::default();
        let a = table
            .register(RequestId::Number(1), PendingKind::Disconnect)
            .expect("a");
        let b = table
            .register(RequestId::Number(2), PendingKind::Execution)
            .expect("b");

        assert_eq!(table.drain(Settlement::Terminated), 2);
        assert_eq!(a.await.expect("a fired"), Settlement::Terminated);
        assert_eq!(b.await.expect("b fired"), Settlement::Terminated);
    }
}
