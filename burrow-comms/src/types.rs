//! Core message types for the burrow mesh.

use serde_json::Value;

use burrow_core::{CommandFault, CorrelationId, UnitId};

use crate::port::MeshPort;

/// A message travelling between mesh members.
///
/// Every frame is stamped with the sender's id before transmission; receivers
/// use it as the reply path for command results.
#[derive(Debug)]
pub struct Frame {
    /// Sender's unit id (or the controller's id).
    pub from: UnitId,
    /// The message content.
    pub signal: Signal,
}

impl Frame {
    pub fn new(from: UnitId, signal: Signal) -> Self {
        Self { from, signal }
    }
}

/// The message classes multiplexed over one channel.
///
/// Inbound frames are inspected once and dispatched on the first matching
/// variant, in this declaration order: identity assignment, sibling
/// announcement/removal, channel handoff, command invocation, command result,
/// configuration push, then the generic event fallthrough.
#[derive(Debug)]
pub enum Signal {
    /// Tells a freshly spawned unit its own id and the controller's.
    Identity { id: UnitId, controller: UnitId },

    /// Binds (or with `terminated` set, removes) a sibling entry. The port,
    /// when present, is one end of a cross-wired pair.
    Sibling {
        id: UnitId,
        port: Option<MeshPort>,
        terminated: bool,
    },

    /// Delivers a private channel endpoint for the named peer; messages
    /// arriving on it re-enter the receiving unit's state machine.
    Handoff { peer: UnitId, port: MeshPort },

    /// Invoke a named command on the receiving unit.
    Invoke {
        command: String,
        args: Vec<Value>,
        target: UnitId,
        correlation: CorrelationId,
    },

    /// The settled outcome of a previous invocation, matched to the caller's
    /// pending callback by correlation id.
    Result {
        correlation: CorrelationId,
        outcome: Result<Value, CommandFault>,
    },

    /// Update the unit's ambient HTTP Basic credential.
    SetHttpAuthorization { value: String },

    /// Update the unit's ambient HTTP access-token header value.
    SetHttpAccessToken { value: String },

    /// Anything else: handed to the listener registry.
    Event { payload: Value },
}

impl Signal {
    /// Structural copy of this signal, for broadcast fan-out.
    ///
    /// Channel endpoints are owned values and move, never copy; signals that
    /// carry one return `None` and cannot be broadcast.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Identity { id, controller } => Some(Self::Identity {
                id: id.clone(),
                controller: controller.clone(),
            }),
            Self::Sibling {
                id,
                port: None,
                terminated,
            } => Some(Self::Sibling {
                id: id.clone(),
                port: None,
                terminated: *terminated,
            }),
            Self::Sibling { port: Some(_), .. } | Self::Handoff { .. } => None,
            Self::Invoke {
                command,
                args,
                target,
                correlation,
            } => Some(Self::Invoke {
                command: command.clone(),
                args: args.clone(),
                target: target.clone(),
                correlation: correlation.clone(),
            }),
            Self::Result {
                correlation,
                outcome,
            } => Some(Self::Result {
                correlation: correlation.clone(),
                outcome: outcome.clone(),
            }),
            Self::SetHttpAuthorization { value } => Some(Self::SetHttpAuthorization {
                value: value.clone(),
            }),
            Self::SetHttpAccessToken { value } => Some(Self::SetHttpAccessToken {
                value: value.clone(),
            }),
            Self::Event { payload } => Some(Self::Event {
                payload: payload.clone(),
            }),
        }
    }

    /// Short name of the message class, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::Sibling { .. } => "sibling",
            Self::Handoff { .. } => "handoff",
            Self::Invoke { .. } => "invoke",
            Self::Result { .. } => "result",
            Self::SetHttpAuthorization { .. } => "set_http_authorization",
            Self::SetHttpAccessToken { .. } => "set_http_access_token",
            Self::Event { .. } => "event",
        }
    }

    /// Diagnostic echo of an invocation, attached to handler failures.
    pub fn invocation_echo(command: &str, args: &[Value], correlation: &CorrelationId) -> Value {
        serde_json::json!({
            "command": command,
            "args": args,
            "correlation": correlation,
        })
    }
}
