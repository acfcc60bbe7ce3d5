//! RPC runtime over the framed transport.
//!
//! The server dispatches `CALL_FUNC` requests through a [`FunctionTable`]
//! built once at construction. The client keeps one outstanding call per
//! connection and offers a one-shot async mode.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{AsyncCall, ClientOptions, RpcClient};
pub use server::RpcServer;

use crate::protocol::Value;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Arguments handed to a registered handler
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Positional argument, falling back to a keyword of the same name.
    pub fn value(&self, index: usize, name: &str) -> Result<&Value, String> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| format!("missing argument '{}'", name))
    }

    pub fn str(&self, index: usize, name: &str) -> Result<String, String> {
        let v = self.value(index, name)?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("argument '{}' must be str, got {}", name, v.type_name()))
    }

    pub fn i64(&self, index: usize, name: &str) -> Result<i64, String> {
        let v = self.value(index, name)?;
        v.as_i64()
            .ok_or_else(|| format!("argument '{}' must be int, got {}", name, v.type_name()))
    }

    pub fn bool(&self, index: usize, name: &str) -> Result<bool, String> {
        let v = self.value(index, name)?;
        v.as_bool()
            .ok_or_else(|| format!("argument '{}' must be bool, got {}", name, v.type_name()))
    }

    pub fn opt_str(&self, index: usize, name: &str) -> Option<String> {
        self.value(index, name)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

pub type HandlerResult = std::result::Result<Value, String>;
pub type BlockingHandler = dyn Fn(CallArgs) -> HandlerResult + Send + Sync;
pub type AsyncHandler = dyn Fn(CallArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A registered remote-callable function
#[derive(Clone)]
pub enum Handler {
    /// Runs on the blocking thread pool
    Blocking(Arc<BlockingHandler>),
    /// Runs as a tokio task
    Async(Arc<AsyncHandler>),
}

/// Name → handler registration table
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, Handler>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> HandlerResult + Send + Sync + 'static,
    {
        self.functions
            .insert(name.into(), Handler::Blocking(Arc::new(f)));
        self
    }

    pub fn register_async<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Handler::Async(Arc::new(f)));
        self
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Sorted names, the `FUNC_LIST` reply
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Merge another table in; later registrations win.
    pub fn extend(&mut self, other: FunctionTable) -> &mut Self {
        self.functions.extend(other.functions);
        self
    }
}
