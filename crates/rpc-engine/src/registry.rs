//! Handler registry (§4.5.3): `Def`/`DefAsync` map method names to handler
//! closures, rejecting duplicate registrations. `Def` handlers run inline on
//! the connection's read loop and must stay within one RPC round trip;
//! `DefAsync` handlers are spawned so slow methods don't stall dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use control_proto::jsonrpc::RpcErrorObject;
use serde_json::Value;

use crate::errors::RegistryError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcErrorObject>> + Send>>;
pub type HandlerFn<C> = Arc<dyn Fn(C, Option<Value>) -> HandlerFuture + Send + Sync>;

pub(crate) enum Dispatch<C> {
    Inline(HandlerFn<C>),
    Spawned(HandlerFn<C>),
}

// Manual impl: the derived `Clone` would add a spurious `C: Clone` bound
// even though we only ever clone the `Arc`, never a `C` value.
impl<C> Clone for Dispatch<C> {
    fn clone(&self) -> Self {
        match self {
            Dispatch::Inline(f) => Dispatch::Inline(Arc::clone(f)),
            Dispatch::Spawned(f) => Dispatch::Spawned(Arc::clone(f)),
        }
    }
}

impl<C> Dispatch<C> {
    pub(crate) fn invoke(&self, ctx: C, params: Option<Value>) -> HandlerFuture {
        match self {
            Dispatch::Inline(f) | Dispatch::Spawned(f) => f(ctx, params),
        }
    }

    pub(crate) fn is_spawned(&self) -> bool {
        matches!(self, Dispatch::Spawned(_))
    }
}

/// Method-name → handler map for one connection role. Shared across
/// connections via `Arc`.
pub struct HandlerRegistry<C> {
    handlers: RwLock<HashMap<String, Dispatch<C>>>,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }
}

impl<C> HandlerRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an inline handler, run on the read-loop task.
    pub fn def<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(C, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcErrorObject>> + Send + 'static,
    {
        self.insert(method.into(), Dispatch::Inline(Arc::new(move |ctx, params| Box::pin(handler(ctx, params)))))
    }

    /// Registers an async handler; dispatch spawns a task per invocation.
    pub fn def_async<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(C, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcErrorObject>> + Send + 'static,
    {
        self.insert(method.into(), Dispatch::Spawned(Arc::new(move |ctx, params| Box::pin(handler(ctx, params)))))
    }

    fn insert(&self, method: String, dispatch: Dispatch<C>) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        if handlers.contains_key(&method) {
            return Err(RegistryError::DuplicateMethod(method));
        }
        handlers.insert(method, dispatch);
        Ok(())
    }

    /// Clones out the matching dispatch entry so the caller can invoke it
    /// without holding the registry lock across an `.await`.
    pub(crate) fn lookup(&self, method: &str) -> Option<Dispatch<C>> {
        self.handlers.read().expect("registry lock poisoned").get(method).cloned()
    }
}
