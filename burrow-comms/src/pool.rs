//! Pool controller: the device-facing facade.
//!
//! Spawns execution units one at a time, cross-wires every new unit into the
//! existing mesh before it joins the sibling map, and forwards commands and
//! broadcasts using round-robin selection. The controller has no command
//! registry of its own: commands addressed to it answer Command-Not-Found,
//! and its own dispatch can never fall back to local execution.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use burrow_core::{
    CommandFault, CorrelationId, IdGen, ListenerRegistry, MessageListenable, SharedId, UnitId,
};

use crate::directory::{CommandFuture, DirectoryError, MeshAware, RemoteDirectory};
use crate::handle::{HandleError, UnitHandle};
use crate::http::HttpSettings;
use crate::port::{self, PortReceiver, PortSender};
use crate::types::Signal;

pub use crate::coordinator::UnitScript;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Unit count must be at least 1")]
    InvalidCount,
    #[error("Unknown unit: {0}")]
    UnknownUnit(UnitId),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Handle(#[from] HandleError),
}

/// Shared with the controller's event loop.
struct ControllerState {
    id: UnitId,
    directory: RemoteDirectory,
    listeners: Arc<ListenerRegistry>,
}

pub struct PoolController {
    state: Arc<ControllerState>,
    ids: IdGen,
    script: UnitScript,
    handles: HashMap<UnitId, UnitHandle>,
    inbox_tx: PortSender,
    loop_task: JoinHandle<()>,
    /// Last pushed ambient HTTP configuration, replayed to later spawns.
    http: HttpSettings,
}

impl PoolController {
    /// Create an empty pool. `script` is installed into every unit this pool
    /// spawns, so all units carry the same registered-command set.
    pub fn new(script: UnitScript) -> Self {
        let ids = IdGen::new();
        let id = ids.next_unit_id();
        let (inbox_tx, inbox_rx) = port::channel();
        let state = Arc::new(ControllerState {
            id: id.clone(),
            directory: RemoteDirectory::new(SharedId::preset(id)),
            listeners: Arc::new(ListenerRegistry::new()),
        });
        let loop_task = tokio::spawn(controller_loop(state.clone(), inbox_rx));
        Self {
            state,
            ids,
            script,
            handles: HashMap::new(),
            inbox_tx,
            loop_task,
            http: HttpSettings::default(),
        }
    }

    /// The controller's own id; units use it to address the controller.
    pub fn id(&self) -> &UnitId {
        &self.state.id
    }

    /// Spawn `count` units. Each new unit is cross-wired against every
    /// already-spawned unit before being added to the sibling map, so full
    /// mesh connectivity holds after every single spawn.
    pub fn spawn(&mut self, count: usize) -> Result<Vec<UnitId>, PoolError> {
        if count == 0 {
            return Err(PoolError::InvalidCount);
        }
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.ids.next_unit_id();
            let mut handle = UnitHandle::spawn(
                self.script.clone(),
                id.clone(),
                self.state.id.clone(),
                self.inbox_tx.clone(),
                self.state.listeners.clone(),
            );
            for existing in self.handles.values_mut() {
                handle.cross_wire(existing)?;
            }
            self.state
                .directory
                .register_sibling(id.clone(), handle.sender().clone())?;
            if let Some(auth) = &self.http.authorization {
                handle.send(Signal::SetHttpAuthorization { value: auth.clone() });
            }
            if let Some(token) = &self.http.access_token {
                handle.send(Signal::SetHttpAccessToken {
                    value: token.clone(),
                });
            }
            tracing::debug!(unit = %id, pool = self.handles.len() + 1, "unit spawned and wired");
            self.handles.insert(id.clone(), handle);
            spawned.push(id);
        }
        Ok(spawned)
    }

    /// Dispatch a command to the next round-robin unit and correlate the
    /// reply. With an empty pool the future rejects with `NoUnits`.
    pub fn send_command(&self, name: &str, args: Vec<Value>) -> CommandFuture {
        let Some(target) = self.state.directory.next_sibling() else {
            return CommandFuture::rejected(CommandFault::NoUnits);
        };
        let correlation = CorrelationId::new(self.ids.next_id());
        let future = self.state.directory.register_callback(correlation.clone());
        let signal = Signal::Invoke {
            command: name.to_string(),
            args,
            target: target.clone(),
            correlation: correlation.clone(),
        };
        if !self.state.directory.send_to(&target, signal) {
            self.state
                .directory
                .resolve_callback(&correlation, Err(CommandFault::Unreachable { id: target }));
        }
        future
    }

    /// Post a generic event to the next round-robin unit, returning the
    /// chosen id, or `None` when the pool is empty or the unit unreachable.
    pub fn post_message(&self, payload: Value) -> Option<UnitId> {
        let target = self.state.directory.next_sibling()?;
        if self
            .state
            .directory
            .send_to(&target, Signal::Event { payload })
        {
            Some(target)
        } else {
            None
        }
    }

    /// Post a generic event to every unit.
    pub fn broadcast(&self, payload: Value) {
        self.state.directory.broadcast(&Signal::Event { payload });
    }

    /// Push the ambient HTTP Basic credential to every unit, current and
    /// future.
    pub fn set_http_authorization(&mut self, auth: impl Into<String>) {
        let value = auth.into();
        self.http.authorization = Some(value.clone());
        self.state
            .directory
            .broadcast(&Signal::SetHttpAuthorization { value });
    }

    /// Push the ambient HTTP access token to every unit, current and future.
    pub fn set_http_access_token(&mut self, token: impl Into<String>) {
        let value = token.into();
        self.http.access_token = Some(value.clone());
        self.state
            .directory
            .broadcast(&Signal::SetHttpAccessToken { value });
    }

    /// Terminate one unit and broadcast a removal notice so surviving units
    /// prune the stale mesh entry. Commands already in flight to the unit are
    /// abandoned, not rejected.
    pub fn terminate(&mut self, id: &UnitId) -> Result<(), PoolError> {
        let handle = self
            .handles
            .remove(id)
            .ok_or_else(|| PoolError::UnknownUnit(id.clone()))?;
        self.state.directory.remove_sibling(id);
        handle.terminate();
        self.state.directory.broadcast(&Signal::Sibling {
            id: id.clone(),
            port: None,
            terminated: true,
        });
        Ok(())
    }

    /// Terminate every unit. No removal notices: there is no one left to
    /// notify.
    pub fn terminate_all(&mut self) {
        for (id, handle) in self.handles.drain() {
            self.state.directory.remove_sibling(&id);
            handle.terminate();
        }
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.state.directory.sibling_ids()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl MessageListenable for PoolController {
    fn listeners(&self) -> &ListenerRegistry {
        &self.state.listeners
    }
}

impl MeshAware for PoolController {
    fn directory(&self) -> &RemoteDirectory {
        &self.state.directory
    }
}

impl Drop for PoolController {
    fn drop(&mut self) {
        self.terminate_all();
        self.loop_task.abort();
    }
}

/// The controller's event loop over frames posted by its units.
async fn controller_loop(state: Arc<ControllerState>, mut inbox: PortReceiver) {
    while let Some(frame) = inbox.recv().await {
        match frame.signal {
            Signal::Result {
                correlation,
                outcome,
            } => state.directory.resolve_callback(&correlation, outcome),
            Signal::Invoke {
                command,
                correlation,
                ..
            } => {
                // No command registry on the controller: this is its whole
                // handler path.
                let reply = Signal::Result {
                    correlation,
                    outcome: Err(CommandFault::CommandNotFound { name: command }),
                };
                if !state.directory.send_to(&frame.from, reply) {
                    tracing::warn!(unit = %frame.from, "reply to unknown unit dropped");
                }
            }
            Signal::Event { payload } => state.listeners.dispatch(&payload),
            other => {
                tracing::warn!(
                    kind = other.kind(),
                    unit = %frame.from,
                    "unexpected frame at controller dropped"
                );
            }
        }
    }
    tracing::debug!("controller inbox closed; loop exiting");
}
