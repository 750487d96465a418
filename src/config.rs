use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bindings::Bindings;
use crate::sandbox::{
    default_worker_program, SandboxOptions, ScriptSource, DEFAULT_MEMORY_LIMIT_MB,
};

/// Runner configuration, loaded from TOML.
///
/// ```toml
/// [sandbox]
/// script = "scripts/greeting.js"
/// helper = "scripts/helper.js"
/// memory_limit_mb = 64
/// time_limit_seconds = 10
///
/// [bindings]
/// getName = "Elly"
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub sandbox: SandboxConfig,
    /// Constant-valued bindings: each key answers requests with its value
    #[serde(default)]
    pub bindings: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Path to the script module. Relative paths are resolved against the
    /// config file's directory.
    pub script: Option<PathBuf>,
    /// Inline module source, as an alternative to `script`
    pub source: Option<String>,
    pub helper: Option<PathBuf>,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_time_limit_seconds")]
    pub time_limit_seconds: f64,
    /// Worker executable; defaults to `$FRAGMENTS_WORKER` or the binary
    /// installed next to the runner.
    pub worker: Option<PathBuf>,
}

fn default_memory_limit_mb() -> u32 {
    DEFAULT_MEMORY_LIMIT_MB
}

fn default_time_limit_seconds() -> f64 {
    60.0
}

impl SandboxConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.time_limit_seconds)
    }

    /// Human-readable description of the script origin
    pub fn source_description(&self) -> String {
        match (&self.script, &self.source) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(source)) => format!("inline ({} bytes)", source.len()),
            (None, None) => "none".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SCRIPTS_DIR}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        match (&self.sandbox.script, &self.sandbox.source) {
            (Some(_), Some(_)) => anyhow::bail!("[sandbox] sets both `script` and `source`"),
            (None, None) => anyhow::bail!("[sandbox] needs either `script` or `source`"),
            _ => {}
        }
        if !(self.sandbox.time_limit_seconds.is_finite() && self.sandbox.time_limit_seconds > 0.0) {
            anyhow::bail!("[sandbox] time_limit_seconds must be a positive number");
        }
        if self.sandbox.memory_limit_mb == 0 {
            anyhow::bail!("[sandbox] memory_limit_mb must be greater than zero");
        }
        Ok(())
    }

    /// Builds sandbox options, resolving relative paths against `base_dir`.
    pub fn sandbox_options(&self, base_dir: &Path) -> SandboxOptions {
        let resolve = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                base_dir.join(path)
            }
        };

        let script = match (&self.sandbox.script, &self.sandbox.source) {
            (Some(path), _) => ScriptSource::File(resolve(path)),
            (None, Some(source)) => ScriptSource::Inline(source.clone()),
            (None, None) => ScriptSource::Inline(String::new()),
        };

        let bindings = self
            .bindings
            .iter()
            .fold(Bindings::new(), |bindings, (name, value)| {
                bindings.with_value(name.clone(), value.clone())
            });

        let mut options = SandboxOptions::new(script)
            .with_memory_limit_mb(self.sandbox.memory_limit_mb)
            .with_time_limit(self.sandbox.time_limit())
            .with_bindings(bindings)
            .with_worker_program(
                self.sandbox
                    .worker
                    .as_ref()
                    .map(resolve)
                    .unwrap_or_else(default_worker_program),
            );
        if let Some(helper) = &self.sandbox.helper {
            options = options.with_helper(ScriptSource::File(resolve(helper)));
        }
        options
    }
}
