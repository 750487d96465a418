//! Host side of the sandbox.
//!
//! A [`Sandbox`] holds the configuration shared by its executions: the
//! script, an optional helper library, the memory and time limits and the
//! bindings the script may call. Each [`Execution`] spawns its own worker
//! process, rendezvous with it over a loopback TCP socket and supervises it
//! until the process has exited and every resource has been released.
//!
//! Isolation layers:
//!
//! 1. Process isolation: every execution is a separate worker process
//! 2. Capability allow-list: the script reaches the host only through bindings
//! 3. Memory cap: the worker's script heap is limited
//! 4. Wall-clock limit: overrunning workers are killed

mod cleanup;
mod connection;
mod error;
mod execution;
mod process;
mod status;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use cleanup::{CleanupFlags, Resource};
pub use error::ExecutionError;
pub use execution::{Execution, ExecutionEvent};
pub use status::Status;

use crate::bindings::Bindings;

pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 100;
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(60);

/// Environment variable overriding the worker executable.
pub const WORKER_ENV: &str = "FRAGMENTS_WORKER";
const WORKER_NAME: &str = "fragments-worker";

/// Where a script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// An ES module on disk.
    File(PathBuf),
    /// Module source text, written to a temporary file for each execution.
    Inline(String),
}

impl ScriptSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ScriptSource::File(path.into())
    }

    pub fn inline(source: impl Into<String>) -> Self {
        ScriptSource::Inline(source.into())
    }

    fn materialize(&self) -> std::io::Result<Materialized> {
        match self {
            ScriptSource::File(path) => Ok(Materialized {
                path: std::fs::canonicalize(path)?,
                temp: None,
            }),
            ScriptSource::Inline(source) => {
                let mut file = tempfile::Builder::new()
                    .prefix("fragment-")
                    .suffix(".js")
                    .tempfile()?;
                file.write_all(source.as_bytes())?;
                file.flush()?;
                Ok(Materialized {
                    path: file.path().to_path_buf(),
                    temp: Some(file),
                })
            }
        }
    }
}

/// A script resolved to a path the worker can load.
struct Materialized {
    path: PathBuf,
    temp: Option<tempfile::NamedTempFile>,
}

/// Configuration shared by every execution of a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub script: ScriptSource,
    /// Optional library evaluated before the script; its default export may
    /// extend the script's context.
    pub helper: Option<ScriptSource>,
    pub memory_limit_mb: u32,
    pub time_limit: Duration,
    pub bindings: Bindings,
    pub worker_program: PathBuf,
}

impl SandboxOptions {
    pub fn new(script: ScriptSource) -> Self {
        Self {
            script,
            helper: None,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            time_limit: DEFAULT_TIME_LIMIT,
            bindings: Bindings::new(),
            worker_program: default_worker_program(),
        }
    }

    pub fn with_helper(mut self, helper: ScriptSource) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u32) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }
}

/// Locates the worker executable.
///
/// `FRAGMENTS_WORKER` wins; otherwise the worker is expected next to the
/// current executable (or one level up, for test binaries under `deps/`).
pub fn default_worker_program() -> PathBuf {
    if let Some(path) = std::env::var_os(WORKER_ENV) {
        return PathBuf::from(path);
    }

    let file_name = format!("{WORKER_NAME}{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        while let Some(current) = dir {
            let candidate = current.join(&file_name);
            if candidate.is_file() {
                return candidate;
            }
            if current.file_name().map_or(true, |name| name != "deps") {
                break;
            }
            dir = current.parent();
        }
    }
    PathBuf::from(file_name)
}

/// Factory for executions sharing one configuration.
#[derive(Debug, Clone)]
pub struct Sandbox {
    options: Arc<SandboxOptions>,
    bindings: Arc<Bindings>,
}

impl Sandbox {
    pub fn new(options: SandboxOptions) -> Self {
        let bindings = Arc::new(options.bindings.clone());
        Self {
            options: Arc::new(options),
            bindings,
        }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Spawns a worker for one run of the script with `args`.
    ///
    /// Must be called from within a Tokio runtime. The worker starts
    /// loading immediately; launch failures are reported through the
    /// execution's status rather than returned here.
    pub fn create_execution(&self, args: Vec<Value>) -> Execution {
        Execution::launch(&self.options, self.bindings.clone(), args)
    }
}
