//! Worker-side coordinator.
//!
//! Runs inside each spawned unit: owns the command registry, talks to the
//! controller and to siblings reached through private channels, interprets
//! every inbound frame, and executes registered commands. The event loop is a
//! single consumer of the unit's inbox; command handlers run as their own
//! tasks so the loop keeps draining while a handler waits — including on a
//! command targeted back at this same unit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use burrow_core::{
    CommandFault, CorrelationId, IdGen, ListenerRegistry, MessageListenable, SharedId, UnitId,
};

use crate::directory::{CommandFuture, MeshAware, RemoteDirectory};
use crate::http::{self, HttpError, HttpSettings};
use crate::port::{MeshPort, PortReceiver, PortSender};
use crate::registry::{CommandHandler, CommandRegistry};
use crate::types::{Frame, Signal};

/// Business logic installed into every unit at spawn: registers the unit's
/// commands (and listeners) against its context before the event loop starts.
pub type UnitScript = Arc<dyn Fn(&UnitContext) + Send + Sync>;

pub(crate) struct UnitState {
    /// Own id; unset until the controller's identity assignment arrives.
    id: SharedId,
    controller: SharedId,
    ids: IdGen,
    registry: RwLock<CommandRegistry>,
    directory: RemoteDirectory,
    /// The broadcast-capable connection back to the unit that spawned us.
    controller_tx: PortSender,
    /// Loopback into our own inbox.
    self_tx: PortSender,
    listeners: ListenerRegistry,
    http: RwLock<HttpSettings>,
}

impl UnitState {
    pub(crate) fn new(controller_tx: PortSender, self_tx: PortSender) -> Arc<Self> {
        let id = SharedId::unset();
        Arc::new(Self {
            id: id.clone(),
            controller: SharedId::unset(),
            ids: IdGen::new(),
            registry: RwLock::new(CommandRegistry::new()),
            directory: RemoteDirectory::new(id),
            controller_tx,
            self_tx,
            listeners: ListenerRegistry::new(),
            http: RwLock::new(HttpSettings::default()),
        })
    }

    fn frame(&self, signal: Signal) -> Frame {
        Frame::new(self.id.current(), signal)
    }

    /// Route `signal` to `id`: the controller goes over the controller
    /// channel; our own id — or any destination while the sibling set is
    /// empty — loops back into our own inbox without a network hop; anything
    /// else goes through the sibling map. False means unreachable.
    fn send_to_remote(&self, id: &UnitId, signal: Signal) -> bool {
        if self.controller.get() == Some(id) {
            return self.controller_tx.send(self.frame(signal));
        }
        if self.id.get() == Some(id) || !self.directory.has_siblings() {
            return self.self_tx.send(self.frame(signal));
        }
        self.directory.send_to(id, signal)
    }

    /// Issue a named command.
    ///
    /// The name must be registered locally even though execution happens on
    /// the chosen target; with no siblings the command always executes
    /// locally; an explicit target must be this unit, the controller, or a
    /// known sibling. Pre-flight rejections send nothing.
    fn issue_command(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        target: Option<UnitId>,
    ) -> CommandFuture {
        if !self.registry.read().contains(name) {
            return CommandFuture::rejected(CommandFault::UnknownCommand {
                name: name.to_string(),
            });
        }

        let destination = if !self.directory.has_siblings() {
            self.id.current()
        } else if let Some(target) = target {
            let known = self.id.get() == Some(&target)
                || self.controller.get() == Some(&target)
                || self.directory.contains(&target);
            if !known {
                return CommandFuture::rejected(CommandFault::InvalidTarget { id: target });
            }
            target
        } else {
            match self.directory.next_sibling() {
                Some(id) => id,
                None => self.id.current(),
            }
        };

        let correlation = CorrelationId::new(self.ids.next_id());
        let future = self.directory.register_callback(correlation.clone());
        let signal = Signal::Invoke {
            command: name.to_string(),
            args,
            target: destination.clone(),
            correlation: correlation.clone(),
        };
        if !self.send_to_remote(&destination, signal) {
            self.directory
                .resolve_callback(&correlation, Err(CommandFault::Unreachable { id: destination }));
        }
        future
    }

    /// Interpret one inbound frame (the message-type state machine).
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let sender = frame.from;
        match frame.signal {
            Signal::Identity { id, controller } => {
                tracing::debug!(unit = %id, "identity assigned");
                if !self.id.assign(id) {
                    tracing::warn!("duplicate identity assignment ignored");
                }
                let _ = self.controller.assign(controller);
            }
            Signal::Sibling {
                id,
                port,
                terminated,
            } => {
                if terminated {
                    if !self.directory.remove_sibling(&id) {
                        tracing::debug!(sibling = %id, "removal notice for unknown sibling");
                    }
                } else if let Some(port) = port {
                    self.bind_sibling(id, port);
                } else {
                    tracing::warn!(sibling = %id, "sibling announcement without endpoint dropped");
                }
            }
            Signal::Handoff { peer, port } => self.bind_sibling(peer, port),
            Signal::Invoke {
                command,
                args,
                target: _,
                correlation,
            } => self.execute(sender, command, args, correlation),
            Signal::Result {
                correlation,
                outcome,
            } => self.directory.resolve_callback(&correlation, outcome),
            Signal::SetHttpAuthorization { value } => {
                self.http.write().authorization = Some(value);
            }
            Signal::SetHttpAccessToken { value } => {
                self.http.write().access_token = Some(value);
            }
            Signal::Event { payload } => self.listeners.dispatch(&payload),
        }
    }

    /// Bind a delivered channel endpoint to `peer` and pump its inbound side
    /// into our own inbox, re-entering the state machine.
    fn bind_sibling(self: &Arc<Self>, peer: UnitId, port: MeshPort) {
        let (sender, mut receiver) = port.split();
        match self.directory.register_sibling(peer.clone(), sender) {
            Ok(()) => {
                let self_tx = self.self_tx.clone();
                tokio::spawn(async move {
                    while let Some(frame) = receiver.recv().await {
                        if !self_tx.send(frame) {
                            break;
                        }
                    }
                    tracing::debug!(sibling = %peer, "private channel closed");
                });
            }
            Err(err) => tracing::warn!(%err, "channel handoff rejected"),
        }
    }

    /// Execute an inbound invocation and post the settled outcome back to the
    /// sender under the same correlation id.
    fn execute(
        self: &Arc<Self>,
        sender: UnitId,
        command: String,
        args: Vec<Value>,
        correlation: CorrelationId,
    ) {
        let handler = self.registry.read().get(&command);
        let Some(handler) = handler else {
            let reply = Signal::Result {
                correlation,
                outcome: Err(CommandFault::CommandNotFound { name: command }),
            };
            if !self.send_to_remote(&sender, reply) {
                tracing::warn!(%sender, "command-not-found reply undeliverable");
            }
            return;
        };

        let state = self.clone();
        tokio::spawn(async move {
            let echo = Signal::invocation_echo(&command, &args, &correlation);
            let call = AssertUnwindSafe(handler.call(sender.clone(), args)).catch_unwind();
            let outcome = match call.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(fault.with_previous_event(echo)),
                Err(_) => Err(CommandFault::handler_failed("command handler panicked")
                    .with_previous_event(echo)),
            };
            let reply = Signal::Result {
                correlation,
                outcome,
            };
            if !state.send_to_remote(&sender, reply) {
                tracing::warn!(%sender, "command result undeliverable");
            }
        });
    }
}

/// The worker-side API handed to unit scripts and command handlers.
#[derive(Clone)]
pub struct UnitContext {
    state: Arc<UnitState>,
}

impl UnitContext {
    pub(crate) fn new(state: Arc<UnitState>) -> Self {
        Self { state }
    }

    /// Own id; `None` until the controller's identity assignment arrives
    /// (scripts run before it does).
    pub fn id(&self) -> Option<UnitId> {
        self.state.id.get().cloned()
    }

    pub fn controller_id(&self) -> Option<UnitId> {
        self.state.controller.get().cloned()
    }

    /// Register (or replace) a command handler under `name`.
    pub fn register_command(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.state.registry.write().register(name, handler);
    }

    pub fn command_names(&self) -> Vec<String> {
        self.state.registry.read().names()
    }

    /// Issue a command to `target`, or to the next round-robin sibling when
    /// no target is given. See [`CommandFuture`] for settlement semantics.
    pub fn send_command(
        &self,
        name: &str,
        args: Vec<Value>,
        target: Option<UnitId>,
    ) -> CommandFuture {
        self.state.issue_command(name, args, target)
    }

    /// Post a generic event to the controller. False if the controller side
    /// is gone.
    pub fn emit(&self, payload: Value) -> bool {
        self.state
            .controller_tx
            .send(self.state.frame(Signal::Event { payload }))
    }

    /// Snapshot of the ambient HTTP configuration.
    pub fn http_settings(&self) -> HttpSettings {
        self.state.http.read().clone()
    }

    /// Issue an HTTP request with ambient auth-header injection.
    pub async fn http_request(
        &self,
        method: &str,
        url: &str,
        body: Option<Value>,
        headers: &[(String, String)],
    ) -> Result<Value, HttpError> {
        let settings = self.http_settings();
        http::http_request(&settings, method, url, body, headers).await
    }
}

impl MessageListenable for UnitContext {
    fn listeners(&self) -> &ListenerRegistry {
        &self.state.listeners
    }
}

impl MeshAware for UnitContext {
    fn directory(&self) -> &RemoteDirectory {
        &self.state.directory
    }
}

/// The unit's event loop: run the script, then drain the inbox until every
/// sender is gone.
pub(crate) async fn run(state: Arc<UnitState>, mut inbox: PortReceiver, script: UnitScript) {
    let ctx = UnitContext::new(state.clone());
    (*script)(&ctx);
    while let Some(frame) = inbox.recv().await {
        state.handle_frame(frame);
    }
    tracing::debug!("unit inbox closed; coordinator exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::port;
    use crate::registry::command_fn;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestUnit {
        state: Arc<UnitState>,
        ctx: UnitContext,
        inbox_tx: PortSender,
        controller_rx: PortReceiver,
    }

    /// Spawn a coordinator loop around a fresh unit state, keeping the
    /// controller-side receiver so tests can observe outbound frames.
    fn make_unit(script: UnitScript) -> TestUnit {
        let (controller_tx, controller_rx) = port::channel();
        let (inbox_tx, inbox_rx) = port::channel();
        let state = UnitState::new(controller_tx, inbox_tx.clone());
        let ctx = UnitContext::new(state.clone());
        tokio::spawn(run(state.clone(), inbox_rx, script));
        TestUnit {
            state,
            ctx,
            inbox_tx,
            controller_rx,
        }
    }

    fn assign_identity(unit: &TestUnit, id: &str) {
        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Identity {
                id: UnitId::new(id),
                controller: UnitId::new("device"),
            },
        ));
    }

    fn noop_script() -> UnitScript {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_identity_assigned_once() {
        let unit = make_unit(noop_script());
        assign_identity(&unit, "u1");
        tokio::task::yield_now().await;
        assert_eq!(unit.ctx.id(), Some(UnitId::new("u1")));

        // A second assignment is ignored.
        assign_identity(&unit, "u2");
        tokio::task::yield_now().await;
        assert_eq!(unit.ctx.id(), Some(UnitId::new("u1")));
    }

    #[tokio::test]
    async fn test_unknown_command_rejects_without_sending() {
        let mut unit = make_unit(noop_script());
        assign_identity(&unit, "u1");
        tokio::task::yield_now().await;

        let fault = unit
            .ctx
            .send_command("missing", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(fault, CommandFault::UnknownCommand { name } if name == "missing"));
        assert_eq!(unit.state.directory.pending_count(), 0);
        assert!(unit.controller_rx.try_drain().is_empty());
    }

    #[tokio::test]
    async fn test_zero_siblings_executes_locally() {
        let unit = make_unit(Arc::new(|ctx: &UnitContext| {
            ctx.register_command(
                "echo",
                command_fn(|_sender, args| Ok(args.into_iter().next().unwrap_or(Value::Null))),
            );
        }));
        assign_identity(&unit, "u1");
        // Let the loop task run the script before dispatching.
        tokio::task::yield_now().await;

        // Explicit bogus target: with no siblings the command still runs
        // locally.
        let result = unit
            .ctx
            .send_command("echo", vec![json!(42)], Some(UnitId::new("ghost")))
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_invalid_target_rejects_without_sending() {
        let unit = make_unit(Arc::new(|ctx: &UnitContext| {
            ctx.register_command("echo", command_fn(|_, args| Ok(json!(args))));
        }));
        assign_identity(&unit, "u1");
        tokio::task::yield_now().await;

        // Give the unit one sibling so dispatch does not fall back to local
        // execution.
        let (sibling_end, mut our_view) = {
            let (a, b) = MeshPort::pair();
            (a, b)
        };
        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Handoff {
                peer: UnitId::new("u2"),
                port: sibling_end,
            },
        ));
        tokio::task::yield_now().await;

        let fault = unit
            .ctx
            .send_command("echo", vec![], Some(UnitId::new("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(fault, CommandFault::InvalidTarget { id } if id == UnitId::new("ghost")));
        assert!(our_view.receiver.try_drain().is_empty(), "nothing sent");
        assert_eq!(unit.state.directory.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_unknown_name_replies_command_not_found() {
        let mut unit = make_unit(noop_script());
        assign_identity(&unit, "u1");

        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Invoke {
                command: "nope".to_string(),
                args: vec![],
                target: UnitId::new("u1"),
                correlation: CorrelationId::new("c1"),
            },
        ));

        let reply = timeout(Duration::from_secs(1), unit.controller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.from, UnitId::new("u1"));
        match reply.signal {
            Signal::Result {
                correlation,
                outcome,
            } => {
                assert_eq!(correlation, CorrelationId::new("c1"));
                let fault = outcome.unwrap_err();
                assert!(
                    matches!(fault, CommandFault::CommandNotFound { name } if name == "nope")
                );
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_stringified_with_echo() {
        let mut unit = make_unit(Arc::new(|ctx: &UnitContext| {
            ctx.register_command(
                "explode",
                command_fn(|_, _| Err(CommandFault::handler_failed("kaboom"))),
            );
        }));
        assign_identity(&unit, "u1");

        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Invoke {
                command: "explode".to_string(),
                args: vec![json!(1)],
                target: UnitId::new("u1"),
                correlation: CorrelationId::new("c2"),
            },
        ));

        let reply = timeout(Duration::from_secs(1), unit.controller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match reply.signal {
            Signal::Result { outcome, .. } => match outcome.unwrap_err() {
                CommandFault::HandlerFailed {
                    message,
                    previous_event,
                } => {
                    assert_eq!(message, "kaboom");
                    let echo = previous_event.unwrap();
                    assert_eq!(echo["command"], "explode");
                    assert_eq!(echo["correlation"], "c2");
                }
                other => panic!("expected HandlerFailed, got {other:?}"),
            },
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let mut unit = make_unit(Arc::new(|ctx: &UnitContext| {
            ctx.register_command("panic", command_fn(|_, _| panic!("handler bug")));
        }));
        assign_identity(&unit, "u1");

        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Invoke {
                command: "panic".to_string(),
                args: vec![],
                target: UnitId::new("u1"),
                correlation: CorrelationId::new("c3"),
            },
        ));

        let reply = timeout(Duration::from_secs(1), unit.controller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match reply.signal {
            Signal::Result { outcome, .. } => {
                assert!(matches!(
                    outcome.unwrap_err(),
                    CommandFault::HandlerFailed { .. }
                ));
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_configuration_push_updates_ambient_settings() {
        let unit = make_unit(noop_script());
        assign_identity(&unit, "u1");

        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::SetHttpAuthorization {
                value: "Basic Zm9vOmJhcg==".to_string(),
            },
        ));
        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::SetHttpAccessToken {
                value: "tok-1".to_string(),
            },
        ));
        tokio::task::yield_now().await;

        let settings = unit.ctx.http_settings();
        assert_eq!(settings.authorization.as_deref(), Some("Basic Zm9vOmJhcg=="));
        assert_eq!(settings.access_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_generic_event_reaches_listeners() {
        let unit = make_unit(noop_script());
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        unit.ctx.add_listener(move |event| {
            let _ = seen_tx.send(event.clone());
        });

        unit.inbox_tx.send(Frame::new(
            UnitId::new("device"),
            Signal::Event {
                payload: json!({"hello": "burrow"}),
            },
        ));

        let event = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event["hello"], "burrow");
    }

    #[tokio::test]
    async fn test_reentrant_self_command_does_not_deadlock() {
        // `outer` issues `inner` against this same unit and awaits it while
        // the loop keeps draining.
        let unit = make_unit(Arc::new(|ctx: &UnitContext| {
            ctx.register_command("inner", command_fn(|_, _| Ok(json!("inner-done"))));
            let outer_ctx = ctx.clone();
            ctx.register_command(
                "outer",
                crate::registry::command_async(move |_, _| {
                    let ctx = outer_ctx.clone();
                    async move { ctx.send_command("inner", vec![], None).await }.boxed()
                }),
            );
        }));
        assign_identity(&unit, "u1");
        tokio::task::yield_now().await;

        let result = timeout(
            Duration::from_secs(1),
            unit.ctx.send_command("outer", vec![], None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result, json!("inner-done"));
    }
}
