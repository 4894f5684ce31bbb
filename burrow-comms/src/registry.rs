//! Command registry: name -> handler, local to one unit.
//!
//! Business logic registers handlers by name before any command can be
//! dispatched to that name. Registration is last-wins and never transmitted;
//! each unit carries its own copy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use burrow_core::{CommandFault, UnitId};

/// A named command implementation.
///
/// Invoked with the id of the unit (or controller) that issued the command
/// plus the positional arguments. Synchronous logic is an already-resolved
/// future by construction; use [`command_fn`] for plain closures.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, sender: UnitId, args: Vec<Value>) -> Result<Value, CommandFault>;
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`; an existing registration is replaced.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

struct FnCommand<F> {
    f: F,
}

#[async_trait]
impl<F> CommandHandler for FnCommand<F>
where
    F: Fn(UnitId, Vec<Value>) -> Result<Value, CommandFault> + Send + Sync,
{
    async fn call(&self, sender: UnitId, args: Vec<Value>) -> Result<Value, CommandFault> {
        (self.f)(sender, args)
    }
}

struct AsyncFnCommand<F> {
    f: F,
}

#[async_trait]
impl<F> CommandHandler for AsyncFnCommand<F>
where
    F: Fn(UnitId, Vec<Value>) -> BoxFuture<'static, Result<Value, CommandFault>> + Send + Sync,
{
    async fn call(&self, sender: UnitId, args: Vec<Value>) -> Result<Value, CommandFault> {
        (self.f)(sender, args).await
    }
}

/// Wrap a synchronous closure as a command handler.
pub fn command_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(UnitId, Vec<Value>) -> Result<Value, CommandFault> + Send + Sync + 'static,
{
    Arc::new(FnCommand { f })
}

/// Wrap a future-returning closure as a command handler.
pub fn command_async<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(UnitId, Vec<Value>) -> BoxFuture<'static, Result<Value, CommandFault>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(AsyncFnCommand { f })
}
