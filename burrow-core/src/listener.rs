//! Inbound-event listener registry.
//!
//! Messages that carry none of the coordination fields are handed to every
//! registered listener in registration order. This channel is fire-and-forget:
//! a listener that panics is caught and logged, never rethrown, so one bad
//! observer cannot starve the rest or poison the event loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::ids::{IdGen, ListenerId};

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Internal state behind a single lock; the order vec and the table are kept
/// coherent together.
struct ListenerState {
    order: Vec<ListenerId>,
    table: HashMap<ListenerId, Listener>,
}

pub struct ListenerRegistry {
    ids: IdGen,
    state: RwLock<ListenerState>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            ids: IdGen::new(),
            state: RwLock::new(ListenerState {
                order: Vec::new(),
                table: HashMap::new(),
            }),
        }
    }

    /// Register a listener, returning the id used to remove it later.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.ids.next_listener_id();
        let mut state = self.state.write();
        state.order.push(id.clone());
        state.table.insert(id.clone(), Arc::new(listener));
        id
    }

    /// Remove a listener. Unknown ids are a no-op returning false.
    pub fn remove(&self, id: &ListenerId) -> bool {
        let mut state = self.state.write();
        if state.table.remove(id).is_some() {
            state.order.retain(|entry| entry != id);
            true
        } else {
            false
        }
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Listeners run outside the lock, so a listener may register or remove
    /// listeners without deadlocking; such changes take effect on the next
    /// dispatch.
    pub fn dispatch(&self, event: &Value) {
        let listeners: Vec<Listener> = {
            let state = self.state.read();
            state
                .order
                .iter()
                .filter_map(|id| state.table.get(id).cloned())
                .collect()
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(event))).is_err() {
                tracing::warn!("listener panicked during dispatch; continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().table.is_empty()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability of anything that exposes a listener registry.
pub trait MessageListenable {
    fn listeners(&self) -> &ListenerRegistry;

    fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners().add(listener)
    }

    fn remove_listener(&self, id: &ListenerId) -> bool {
        self.listeners().remove(id)
    }
}
