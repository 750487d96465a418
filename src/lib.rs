//! Sandboxed script execution.
//!
//! Each execution runs an untrusted script in its own worker process. The
//! host and the worker talk over a private loopback socket using
//! newline-delimited JSON frames; the script can only reach the host
//! through the bindings it was granted.
//!
//! ```no_run
//! use fragments_runtime::bindings::Bindings;
//! use fragments_runtime::sandbox::{Sandbox, SandboxOptions, ScriptSource};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), fragments_runtime::sandbox::ExecutionError> {
//! let bindings = Bindings::new().with_fn("getName", |_args| async { Ok(json!("Elly")) });
//! let sandbox = Sandbox::new(
//!     SandboxOptions::new(ScriptSource::file("greeting.js")).with_bindings(bindings),
//! );
//!
//! let execution = sandbox.create_execution(vec![json!("morning")]);
//! let greeting = execution.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bindings;
pub mod config;
pub mod protocol;
pub mod sandbox;
pub mod worker;

pub use bindings::{Binding, Bindings};
pub use sandbox::{Execution, ExecutionError, ExecutionEvent, Sandbox, SandboxOptions, ScriptSource, Status};
