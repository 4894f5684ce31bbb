//! Per-member directory of reachable siblings.
//!
//! Every mesh member (the controller and each unit) holds its own directory:
//! the sibling map, the round-robin cursor over it, and the pending-callback
//! table correlating in-flight commands to their eventual results. All three
//! live behind a single lock so the maps can never drift apart.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use burrow_core::{CommandFault, CorrelationId, SharedId, UnitId};

use crate::port::PortSender;
use crate::types::{Frame, Signal};

/// Errors raised by directory mutations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Sibling already registered: {0}")]
    DuplicateSibling(UnitId),
}

type Outcome = Result<Value, CommandFault>;

struct DirectoryState {
    /// Sibling id -> outbound channel endpoint.
    siblings: HashMap<UnitId, PortSender>,
    /// Sibling ids in registration order; the round-robin cursor indexes this.
    order: Vec<UnitId>,
    cursor: usize,
    /// In-flight commands awaiting a correlated result.
    pending: HashMap<CorrelationId, oneshot::Sender<Outcome>>,
}

pub struct RemoteDirectory {
    owner: SharedId,
    state: Mutex<DirectoryState>,
}

impl RemoteDirectory {
    /// `owner` stamps every outbound frame with the sending member's id.
    pub fn new(owner: SharedId) -> Self {
        Self {
            owner,
            state: Mutex::new(DirectoryState {
                siblings: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Add a sibling mapping. A live duplicate is an error; re-registering an
    /// id whose entry was cleared by termination succeeds.
    pub fn register_sibling(
        &self,
        id: UnitId,
        sender: PortSender,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();
        if state.siblings.contains_key(&id) {
            return Err(DirectoryError::DuplicateSibling(id));
        }
        state.order.push(id.clone());
        state.siblings.insert(id, sender);
        Ok(())
    }

    /// Remove a sibling. Returns false if the id was unknown.
    pub fn remove_sibling(&self, id: &UnitId) -> bool {
        let mut state = self.state.lock();
        if state.siblings.remove(id).is_some() {
            state.order.retain(|entry| entry != id);
            true
        } else {
            false
        }
    }

    /// The sibling at the cursor, advancing it by one with wraparound.
    ///
    /// The cursor is reduced modulo the current sibling count before
    /// indexing, so membership changes between selections can skip or repeat
    /// a sibling but never index out of range. Over a fixed set of size k,
    /// k consecutive selections visit each sibling exactly once.
    pub fn next_sibling(&self) -> Option<UnitId> {
        let mut state = self.state.lock();
        if state.order.is_empty() {
            return None;
        }
        let index = state.cursor % state.order.len();
        let id = state.order[index].clone();
        state.cursor = index + 1;
        Some(id)
    }

    /// Stamp `signal` with the owner's id and post it to the named sibling.
    ///
    /// Returns false when the id has no live channel — a routing outcome the
    /// caller branches on, not an error.
    pub fn send_to(&self, id: &UnitId, signal: Signal) -> bool {
        let sender = {
            let state = self.state.lock();
            state.siblings.get(id).cloned()
        };
        match sender {
            Some(sender) => sender.send(Frame::new(self.owner.current(), signal)),
            None => false,
        }
    }

    /// Post a structural copy of `signal` to every current sibling. There is
    /// no aggregated success indicator; unreachable siblings are skipped.
    pub fn broadcast(&self, signal: &Signal) {
        if signal.try_clone().is_none() {
            tracing::warn!("broadcast of a channel-carrying signal dropped");
            return;
        }
        let targets: Vec<(UnitId, PortSender)> = {
            let state = self.state.lock();
            state
                .order
                .iter()
                .filter_map(|id| state.siblings.get(id).map(|s| (id.clone(), s.clone())))
                .collect()
        };
        for (id, sender) in targets {
            let Some(copy) = signal.try_clone() else {
                return;
            };
            if !sender.send(Frame::new(self.owner.current(), copy)) {
                tracing::debug!(sibling = %id, "broadcast target unreachable");
            }
        }
    }

    /// Create and store a pending callback, returning the future that settles
    /// when a result with this correlation id arrives.
    pub fn register_callback(&self, correlation: CorrelationId) -> CommandFuture {
        let (tx, rx) = oneshot::channel();
        self.state.lock().pending.insert(correlation, tx);
        CommandFuture { rx }
    }

    /// Settle the pending callback for `correlation`.
    ///
    /// The entry is removed before its side of the channel is completed, so a
    /// late or duplicate result for the same id finds no entry and is
    /// silently dropped.
    pub fn resolve_callback(&self, correlation: &CorrelationId, outcome: Outcome) {
        let entry = self.state.lock().pending.remove(correlation);
        match entry {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(%correlation, "result with no pending callback dropped");
            }
        }
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.state.lock().siblings.contains_key(id)
    }

    pub fn sibling_ids(&self) -> Vec<UnitId> {
        self.state.lock().order.clone()
    }

    pub fn has_siblings(&self) -> bool {
        !self.state.lock().order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_siblings()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Capability of anything that participates in the mesh.
pub trait MeshAware {
    fn directory(&self) -> &RemoteDirectory;

    fn has_siblings(&self) -> bool {
        self.directory().has_siblings()
    }

    fn sibling_ids(&self) -> Vec<UnitId> {
        self.directory().sibling_ids()
    }
}

/// The caller's handle on an in-flight command.
///
/// Settles exactly once when the correlated result arrives. If no result ever
/// arrives (the target terminated mid-flight) it stays pending indefinitely;
/// callers wanting bounds wrap it in their own timeout.
#[derive(Debug)]
pub struct CommandFuture {
    rx: oneshot::Receiver<Outcome>,
}

impl CommandFuture {
    /// An already-rejected future, for failures detected before anything is
    /// sent.
    pub fn rejected(fault: CommandFault) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(fault));
        Self { rx }
    }

    /// An already-resolved future.
    pub fn resolved(value: Value) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(value));
        Self { rx }
    }
}

impl Future for CommandFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The owning directory was dropped with the callback still
            // registered; the command can no longer settle normally.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CommandFault::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::port;
    use serde_json::json;
    use std::time::Duration;

    fn make_directory() -> RemoteDirectory {
        RemoteDirectory::new(SharedId::preset(UnitId::new("me")))
    }

    #[test]
    fn test_register_and_duplicate() {
        let dir = make_directory();
        let (tx, _rx) = port::channel();
        dir.register_sibling(UnitId::new("u1"), tx.clone()).unwrap();

        let err = dir.register_sibling(UnitId::new("u1"), tx).unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateSibling(id) if id == UnitId::new("u1")));
    }

    #[test]
    fn test_reregister_after_removal() {
        let dir = make_directory();
        let (tx, _rx) = port::channel();
        dir.register_sibling(UnitId::new("u1"), tx.clone()).unwrap();
        assert!(dir.remove_sibling(&UnitId::new("u1")));
        dir.register_sibling(UnitId::new("u1"), tx).unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_remove_unknown() {
        let dir = make_directory();
        assert!(!dir.remove_sibling(&UnitId::new("ghost")));
    }

    #[test]
    fn test_next_sibling_empty() {
        let dir = make_directory();
        assert!(dir.next_sibling().is_none());
        assert!(!dir.has_siblings());
    }

    #[test]
    fn test_round_robin_visits_each_once_per_cycle() {
        let dir = make_directory();
        let mut receivers = Vec::new();
        for name in ["u1", "u2", "u3"] {
            let (tx, rx) = port::channel();
            receivers.push(rx);
            dir.register_sibling(UnitId::new(name), tx).unwrap();
        }

        for _ in 0..4 {
            let cycle: Vec<UnitId> = (0..3).map(|_| dir.next_sibling().unwrap()).collect();
            assert_eq!(
                cycle,
                vec![UnitId::new("u1"), UnitId::new("u2"), UnitId::new("u3")]
            );
        }
    }

    #[test]
    fn test_round_robin_survives_removal() {
        let dir = make_directory();
        let mut receivers = Vec::new();
        for name in ["u1", "u2", "u3"] {
            let (tx, rx) = port::channel();
            receivers.push(rx);
            dir.register_sibling(UnitId::new(name), tx).unwrap();
        }
        assert_eq!(dir.next_sibling(), Some(UnitId::new("u1")));
        assert_eq!(dir.next_sibling(), Some(UnitId::new("u2")));

        // Cursor now points past the end of the shrunk list; selection must
        // wrap rather than panic.
        dir.remove_sibling(&UnitId::new("u2"));
        dir.remove_sibling(&UnitId::new("u3"));
        assert_eq!(dir.next_sibling(), Some(UnitId::new("u1")));
        assert_eq!(dir.next_sibling(), Some(UnitId::new("u1")));
    }

    #[tokio::test]
    async fn test_send_to_stamps_owner() {
        let dir = make_directory();
        let (tx, mut rx) = port::channel();
        dir.register_sibling(UnitId::new("u1"), tx).unwrap();

        assert!(dir.send_to(
            &UnitId::new("u1"),
            Signal::Event {
                payload: json!("hi")
            }
        ));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.from, UnitId::new("me"));
    }

    #[test]
    fn test_send_to_unknown_is_false() {
        let dir = make_directory();
        assert!(!dir.send_to(
            &UnitId::new("ghost"),
            Signal::Event {
                payload: Value::Null
            }
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_sibling() {
        let dir = make_directory();
        let mut receivers = Vec::new();
        for name in ["u1", "u2", "u3"] {
            let (tx, rx) = port::channel();
            receivers.push(rx);
            dir.register_sibling(UnitId::new(name), tx).unwrap();
        }

        dir.broadcast(&Signal::Event {
            payload: json!({"tick": 1}),
        });
        tokio::task::yield_now().await;
        for rx in &mut receivers {
            let frames = rx.try_drain();
            assert_eq!(frames.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_resolve_callback_resolves_future() {
        let dir = make_directory();
        let future = dir.register_callback(CorrelationId::new("c1"));
        dir.resolve_callback(&CorrelationId::new("c1"), Ok(json!(42)));
        assert_eq!(future.await.unwrap(), json!(42));
        assert_eq!(dir.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_callback_rejects_future() {
        let dir = make_directory();
        let future = dir.register_callback(CorrelationId::new("c1"));
        dir.resolve_callback(
            &CorrelationId::new("c1"),
            Err(CommandFault::handler_failed("boom")),
        );
        let fault = future.await.unwrap_err();
        assert!(matches!(fault, CommandFault::HandlerFailed { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_resolution_is_dropped() {
        let dir = make_directory();
        let future = dir.register_callback(CorrelationId::new("c1"));
        dir.resolve_callback(&CorrelationId::new("c1"), Ok(json!(1)));
        // Second settlement for the same id: no pending entry, no effect.
        dir.resolve_callback(&CorrelationId::new("c1"), Ok(json!(2)));
        assert_eq!(future.await.unwrap(), json!(1));
    }

    #[test]
    fn test_unknown_correlation_is_ignored() {
        let dir = make_directory();
        dir.resolve_callback(&CorrelationId::new("never"), Ok(Value::Null));
        assert_eq!(dir.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_callback_stays_pending() {
        let dir = make_directory();
        let future = dir.register_callback(CorrelationId::new("c1"));
        let waited =
            tokio::time::timeout(Duration::from_millis(50), future).await;
        assert!(waited.is_err(), "future must still be pending");
        assert_eq!(dir.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_and_resolved_constructors() {
        assert_eq!(
            CommandFuture::resolved(json!("ok")).await.unwrap(),
            json!("ok")
        );
        let fault = CommandFuture::rejected(CommandFault::ChannelClosed)
            .await
            .unwrap_err();
        assert_eq!(fault, CommandFault::ChannelClosed);
    }
}
