pub mod registry;

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

/// A host-side capability that a worker may invoke by name.
///
/// The worker has no ambient access to the host: every function a script
/// can reach through `context.request()` is a `Binding` registered on the
/// sandbox. Requests are dispatched concurrently, so implementations must
/// tolerate overlapping calls.
#[async_trait]
pub trait Binding: Send + Sync {
    /// Invoke the binding with the positional arguments sent by the script.
    /// The returned value is serialized back as the request's response;
    /// an error is sent back as an error response and rejects the
    /// script's pending call.
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`Binding`].
pub struct FnBinding<F> {
    func: F,
}

impl<F> FnBinding<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Binding for FnBinding<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.func)(args).await
    }
}

/// Binding that always answers with the same value, ignoring arguments.
///
/// Used by the runner configuration, where bindings are declared as
/// plain TOML values.
pub struct ConstantBinding {
    value: Value,
}

impl ConstantBinding {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Binding for ConstantBinding {
    async fn call(&self, _args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(self.value.clone())
    }
}

pub use registry::{BindingError, Bindings};
