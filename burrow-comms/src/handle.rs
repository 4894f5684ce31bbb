//! Controller-side handle for one spawned execution unit.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use burrow_core::{ListenerRegistry, MessageListenable, UnitId};

use crate::coordinator::{self, UnitScript, UnitState};
use crate::port::{self, MeshPort, PortSender};
use crate::types::{Frame, Signal};

/// Errors raised by handle operations.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Units already wired: {0} <-> {1}")]
    AlreadyWired(UnitId, UnitId),
    #[error("Cannot wire a unit to itself: {0}")]
    SelfWire(UnitId),
}

/// One spawned execution unit, seen from the controller.
///
/// Owns the spawn handle and the channel into the unit's inbox, and tracks
/// which siblings this unit has been cross-wired with. Constructed via
/// [`UnitHandle::spawn`], which also performs the immediate identity
/// assignment so the unit learns its own id before any other traffic.
pub struct UnitHandle {
    id: UnitId,
    controller: UnitId,
    sender: PortSender,
    task: JoinHandle<()>,
    wired: HashSet<UnitId>,
    listeners: Arc<ListenerRegistry>,
}

impl UnitHandle {
    /// Spawn a unit: run `script` against a fresh coordinator, assign `id`,
    /// and hand the unit `controller_tx` as its channel back to the spawner.
    pub fn spawn(
        script: UnitScript,
        id: UnitId,
        controller_id: UnitId,
        controller_tx: PortSender,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = port::channel();
        let state = UnitState::new(controller_tx, inbox_tx.clone());
        let task = tokio::spawn(coordinator::run(state, inbox_rx, script));
        let handle = Self {
            id: id.clone(),
            controller: controller_id.clone(),
            sender: inbox_tx,
            task,
            wired: HashSet::new(),
            listeners,
        };
        handle.send(Signal::Identity {
            id,
            controller: controller_id,
        });
        handle
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// The channel into this unit's inbox.
    pub fn sender(&self) -> &PortSender {
        &self.sender
    }

    /// Post a signal to the unit, stamped with the controller's id. False if
    /// the unit's inbox is gone.
    pub fn send(&self, signal: Signal) -> bool {
        self.sender
            .send(Frame::new(self.controller.clone(), signal))
    }

    /// Create one fresh private channel and hand one end to each unit, so the
    /// two can talk without involving the controller.
    pub fn cross_wire(&mut self, other: &mut UnitHandle) -> Result<(), HandleError> {
        if self.id == other.id {
            return Err(HandleError::SelfWire(self.id.clone()));
        }
        if self.wired.contains(&other.id) {
            return Err(HandleError::AlreadyWired(self.id.clone(), other.id.clone()));
        }

        let (port_a, port_b) = MeshPort::pair();
        if !self.send(Signal::Handoff {
            peer: other.id.clone(),
            port: port_a,
        }) {
            tracing::warn!(unit = %self.id, "channel handoff to terminated unit dropped");
        }
        if !other.send(Signal::Handoff {
            peer: self.id.clone(),
            port: port_b,
        }) {
            tracing::warn!(unit = %other.id, "channel handoff to terminated unit dropped");
        }
        self.wired.insert(other.id.clone());
        other.wired.insert(self.id.clone());
        Ok(())
    }

    pub fn is_wired_to(&self, id: &UnitId) -> bool {
        self.wired.contains(id)
    }

    /// Tear the unit down: abort the coordinator task and drop the inbox
    /// channel, which closes every private channel path into the unit.
    ///
    /// Siblings are not notified here; the pool controller broadcasts the
    /// removal notice.
    pub fn terminate(self) {
        tracing::debug!(unit = %self.id, "terminating unit");
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl MessageListenable for UnitHandle {
    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}
