#![cfg_attr(test, allow(clippy::panic))]
// burrow-comms
//! Inter-unit communication and RPC coordination for burrow pools.
//!
//! A [`PoolController`] spawns execution units and cross-wires every pair
//! over a private channel, so the pool forms a full peer mesh rather than a
//! star. Commands registered by the unit script can be invoked from the
//! controller or from any sibling; results come back asynchronously, matched
//! by correlation id.

pub mod coordinator;
pub mod directory;
pub mod handle;
pub mod http;
pub mod pool;
pub mod port;
pub mod registry;
pub mod types;

pub use coordinator::{UnitContext, UnitScript};
pub use directory::{CommandFuture, DirectoryError, MeshAware, RemoteDirectory};
pub use handle::{HandleError, UnitHandle};
pub use http::{ACCESS_TOKEN_HEADER, HttpError, HttpSettings, http_request};
pub use pool::{PoolController, PoolError};
pub use port::{MeshPort, PortReceiver, PortSender};
pub use registry::{CommandHandler, CommandRegistry, command_async, command_fn};
pub use types::{Frame, Signal};

// Re-export the leaf crate so downstream users need only one dependency.
pub use burrow_core::{
    CommandFault, CorrelationId, IdGen, ListenerId, ListenerRegistry, MessageListenable, SharedId,
    UnitId,
};
