//! Script runtime embedded in the worker: a single V8 isolate with an ES
//! module loader and a minimal bridge extension.
//!
//! The script sees no `Deno` global and no host APIs. Its only way out is
//! the `context` object passed to its default export:
//!
//! - `context.request(method, args)` calls a host binding and resolves with
//!   its result (or rejects with the host's error message)
//! - `context.notify(method, args)` sends a fire-and-forget notification
//!
//! Values cross the op boundary as JSON text.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use deno_core::{
    op2, v8, FsModuleLoader, JsRuntime, ModuleSpecifier, OpState, PollEventLoopOptions,
    RuntimeOptions,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Bridge, WorkerError};

const HELPER_SPECIFIER: &str = "file:///__fragments__/helper.js";
const ENTRY_SPECIFIER: &str = "file:///__fragments__/entry.js";

const BOOTSTRAP: &str = r#"
((core) => {
  const ops = core.ops;
  const encode = (args) => JSON.stringify(Array.isArray(args) ? args : [args]);
  const show = (value) => {
    if (typeof value === "string") return value;
    try {
      return JSON.stringify(value) ?? String(value);
    } catch {
      return String(value);
    }
  };
  const printer = (isErr) => (...values) => core.print(values.map(show).join(" ") + "\n", isErr);

  const context = {
    notify(method, args = []) {
      ops.op_fragments_notify(String(method), encode(args));
    },
    async request(method, args = []) {
      const reply = JSON.parse(await ops.op_fragments_request(String(method), encode(args)));
      if ("error" in reply) {
        throw new Error(reply.error);
      }
      return reply.ok;
    },
  };
  const finish = (value) => {
    ops.op_fragments_return(JSON.stringify(value === undefined ? null : value) ?? "null");
  };

  globalThis.console = Object.freeze({
    log: printer(false),
    info: printer(false),
    debug: printer(false),
    warn: printer(true),
    error: printer(true),
  });
  Object.defineProperty(globalThis, "__fragments", {
    value: Object.freeze({ context, finish }),
  });
  delete globalThis.Deno;
})(Deno.core);
"#;

/// Value handed back by the entry glue.
struct ReturnSlot(Value);

fn parse_args(raw: &str) -> Result<Vec<Value>, String> {
    serde_json::from_str(raw).map_err(|e| format!("arguments are not serializable: {e}"))
}

#[op2]
fn op_fragments_notify(state: &mut OpState, #[string] method: String, #[string] args: String) {
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            warn!(%method, error = %e, "dropping notification");
            return;
        }
    };
    if let Err(e) = state.borrow::<Bridge>().notify(method, args) {
        warn!(error = %e, "dropping notification");
    }
}

#[op2(async)]
#[string]
async fn op_fragments_request(
    state: Rc<RefCell<OpState>>,
    #[string] method: String,
    #[string] args: String,
) -> String {
    let bridge = state.borrow().borrow::<Bridge>().clone();
    let reply = match parse_args(&args) {
        Ok(args) => bridge.request(method, args).await,
        Err(e) => Err(e),
    };
    match reply {
        Ok(value) => json!({ "ok": value }).to_string(),
        Err(message) => json!({ "error": message }).to_string(),
    }
}

#[op2]
fn op_fragments_return(state: &mut OpState, #[string] value: String) {
    let value = serde_json::from_str(&value).unwrap_or(Value::Null);
    state.put(ReturnSlot(value));
}

deno_core::extension!(
    fragments_bridge,
    ops = [op_fragments_notify, op_fragments_request, op_fragments_return],
);

/// The worker's isolate.
pub struct ScriptRuntime {
    js: JsRuntime,
    cwd: PathBuf,
}

impl ScriptRuntime {
    /// Creates the isolate, caps its heap at `memory_mb` and installs the
    /// bridge. The isolate aborts the process if the cap is exceeded.
    pub fn new(bridge: Bridge, memory_mb: Option<u32>) -> Result<Self, WorkerError> {
        let create_params = memory_mb.map(|mb| {
            let bytes = mb as usize * 1024 * 1024;
            v8::CreateParams::default().heap_limits(0, bytes)
        });

        let mut js = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(FsModuleLoader)),
            extensions: vec![fragments_bridge::init()],
            create_params,
            ..Default::default()
        });
        js.op_state().borrow_mut().put(bridge);
        js.execute_script("[fragments:bootstrap]", BOOTSTRAP)
            .map_err(script_error)?;

        let cwd = std::env::current_dir()?;
        Ok(Self { js, cwd })
    }

    /// Evaluates the helper library. If its default export is a function it
    /// is called with the context, and the object it resolves to is merged
    /// into the context the script will receive.
    pub async fn load_helper(&mut self, path: &Path) -> Result<(), WorkerError> {
        let url = self.module_url(path)?;
        debug!(%url, "loading helper");
        let glue = format!(
            r#"import * as helper from {url};
const {{ context }} = globalThis.__fragments;
if (typeof helper.default === "function") {{
  const extra = await helper.default(context);
  if (extra !== null && typeof extra === "object") {{
    Object.assign(context, extra);
  }}
}}
"#,
            url = js_string(url.as_str())
        );
        self.evaluate(HELPER_SPECIFIER, glue).await
    }

    /// Runs the script's default export with `(context, ...args)` and
    /// returns what it resolved to (`null` for `undefined`).
    pub async fn run_entry(&mut self, path: &Path, args: &[Value]) -> Result<Value, WorkerError> {
        let url = self.module_url(path)?;
        debug!(%url, args = args.len(), "running script");
        let glue = format!(
            r#"import * as entry from {url};
const {{ context, finish }} = globalThis.__fragments;
if (typeof entry.default !== "function") {{
  throw new TypeError("script must export a default function");
}}
finish(await entry.default(context, ...{args}));
"#,
            url = js_string(url.as_str()),
            args = Value::from(args.to_vec())
        );
        self.evaluate(ENTRY_SPECIFIER, glue).await?;

        let state = self.js.op_state();
        let slot = state.borrow_mut().try_take::<ReturnSlot>();
        slot.map(|ReturnSlot(value)| value)
            .ok_or_else(|| WorkerError::Script("script finished without a result".to_string()))
    }

    fn module_url(&self, path: &Path) -> Result<ModuleSpecifier, WorkerError> {
        deno_core::resolve_path(&path.to_string_lossy(), &self.cwd).map_err(script_error)
    }

    async fn evaluate(&mut self, specifier: &str, code: String) -> Result<(), WorkerError> {
        let specifier = ModuleSpecifier::parse(specifier).map_err(script_error)?;
        let module_id = self
            .js
            .load_side_es_module_from_code(&specifier, code)
            .await
            .map_err(script_error)?;
        let evaluation = self.js.mod_evaluate(module_id);
        self.js
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(script_error)?;
        evaluation.await.map_err(script_error)
    }
}

fn script_error(e: impl std::fmt::Display) -> WorkerError {
    WorkerError::Script(e.to_string())
}

/// Quotes `s` as a JavaScript string literal.
fn js_string(s: &str) -> String {
    Value::from(s).to_string()
}
