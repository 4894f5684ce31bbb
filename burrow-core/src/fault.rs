//! Serializable command failures.
//!
//! A failure produced while executing a command on a remote unit cannot cross
//! the channel boundary as a live error value; it is flattened into a
//! `CommandFault` at the executing unit and rebuilt into a rejected future on
//! the caller's side.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::UnitId;

/// Why a command did not produce a result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandFault {
    /// The target unit has no handler registered under this name.
    #[error("Command not found on target: {name}")]
    CommandNotFound { name: String },

    /// The caller itself does not recognize the command it tried to issue.
    ///
    /// A unit may only initiate commands it knows how to handle, even when
    /// the execution happens elsewhere.
    #[error("Command not registered locally: {name}")]
    UnknownCommand { name: String },

    /// The explicit target id is not in the sibling set.
    #[error("Invalid target unit: {id}")]
    InvalidTarget { id: UnitId },

    /// No live channel to the destination.
    #[error("No route to unit: {id}")]
    Unreachable { id: UnitId },

    /// The pool has no units to dispatch to. The controller cannot fall back
    /// to local execution: it has no command registry.
    #[error("No units available to execute the command")]
    NoUnits,

    /// The handler ran and failed; `message` is the stringified error.
    #[error("Command handler failed: {message}")]
    HandlerFailed {
        message: String,
        /// Diagnostic echo of the invocation that failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_event: Option<Value>,
    },

    /// The result channel closed before any result arrived.
    #[error("Command channel closed before a result arrived")]
    ChannelClosed,
}

impl CommandFault {
    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            previous_event: None,
        }
    }

    /// Attach the invocation echo to a handler failure. Other fault kinds
    /// already identify their cause and are returned unchanged.
    pub fn with_previous_event(self, event: Value) -> Self {
        match self {
            Self::HandlerFailed { message, .. } => Self::HandlerFailed {
                message,
                previous_event: Some(event),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CommandNotFound { .. } => "command_not_found",
            Self::UnknownCommand { .. } => "unknown_command",
            Self::InvalidTarget { .. } => "invalid_target",
            Self::Unreachable { .. } => "unreachable",
            Self::NoUnits => "no_units",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::ChannelClosed => "channel_closed",
        }
    }
}
