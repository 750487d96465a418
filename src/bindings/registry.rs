/// Bindings registry: the allow-list of host functions a worker may call.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{Binding, ConstantBinding, FnBinding};

/// Failure to serve a worker request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("binding '{0}' is not registered")]
    NotFound(String),
    #[error("binding '{method}' failed: {message}")]
    Failed { method: String, message: String },
}

/// Named set of bindings granted to a sandbox.
///
/// Cloning is cheap: bindings are shared behind `Arc` and never mutated
/// once the sandbox is built.
#[derive(Clone, Default)]
pub struct Bindings {
    entries: HashMap<String, Arc<dyn Binding>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a binding, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, binding: impl Binding + 'static) {
        let name = name.into();
        if self.entries.insert(name.clone(), Arc::new(binding)).is_some() {
            warn!(binding = %name, "replacing previously registered binding");
        }
    }

    /// Registers an async closure as a binding.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, FnBinding::new(func));
    }

    /// Builder-style variant of [`Bindings::register_fn`].
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_fn(name, func);
        self
    }

    /// Builder-style registration of a constant-valued binding.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.register(name, ConstantBinding::new(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Binding>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted for stable output.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `method` and invokes it.
    ///
    /// Unknown names are reported as [`BindingError::NotFound`] rather than
    /// ignored: the worker is blocked on the response and would otherwise
    /// wait forever.
    pub async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value, BindingError> {
        let binding = self
            .get(method)
            .ok_or_else(|| BindingError::NotFound(method.to_string()))?;

        debug!(binding = method, args = args.len(), "invoking binding");
        binding
            .call(args)
            .await
            .map_err(|e| BindingError::Failed {
                method: method.to_string(),
                message: format!("{e:#}"),
            })
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("names", &self.names())
            .finish()
    }
}
