//! Configuration Loader
//! - Reads `probe-harness.toml` from a project root (tracer + target settings)
//! - Applies `PROBE_HARNESS_*` environment overrides on top

use crate::engine::{Bpftrace, CommandTemplate, DTrace, TraceEngine};
use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "probe-harness.toml";

pub const ENV_SUDO: &str = "PROBE_HARNESS_SUDO";
pub const ENV_TRACER: &str = "PROBE_HARNESS_TRACER";
pub const ENV_TIMEOUT_SECS: &str = "PROBE_HARNESS_TIMEOUT_SECS";
pub const ENV_KEEP_FILES: &str = "PROBE_HARNESS_KEEP_FILES";
pub const ENV_INTERPRETER: &str = "PROBE_HARNESS_INTERPRETER";

const DEFAULT_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// Tracer Configuration
// =============================================================================

/// Which tracing engine launches the target
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Dtrace,
    Bpftrace,
    /// Arbitrary argv template (`tracer.argv`)
    Command,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TracerConfig {
    pub engine: EngineKind,
    /// Tracer executable, overriding the engine's default
    pub program: Option<String>,
    /// Argv template for `engine = "command"`
    pub argv: Vec<String>,
    /// Prefix of the command tracer's child-exit notices; defaults to the
    /// file name of `argv[0]`
    pub notice_prefix: Option<String>,
    /// Privilege prefix, e.g. `"sudo -n"`
    pub sudo: Option<String>,
    /// Join deadline; 0 disables it
    pub timeout_secs: u64,
    /// Leave the invocation workspace behind after the record is dropped
    pub keep_files: bool,
    /// Pass `-q` to DTrace
    pub quiet: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            program: None,
            argv: Vec::new(),
            notice_prefix: None,
            sudo: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            keep_files: false,
            quiet: true,
        }
    }
}

// =============================================================================
// Target Configuration
// =============================================================================

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    /// Command prefix; the materialized target path is appended
    pub interpreter: Vec<String>,
    /// Suffix for the materialized target file
    pub suffix: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["ruby".to_string()],
            suffix: ".rb".to_string(),
        }
    }
}

// =============================================================================
// Harness Configuration
// =============================================================================

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub tracer: TracerConfig,
    pub target: TargetConfig,
}

impl HarnessConfig {
    /// Load `probe-harness.toml` from `root`, falling back to defaults when
    /// the file does not exist. Environment overrides are applied afterwards.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .map_err(HarnessError::io("reading probe-harness.toml"))?;
            debug!(path = %config_path.display(), "loaded harness config");
            Self::from_toml_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            HarnessError::Config(format!("failed to parse {}: {}", CONFIG_FILE_NAME, e))
        })
    }

    /// Apply `PROBE_HARNESS_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(sudo) = lookup(ENV_SUDO) {
            self.tracer.sudo = if sudo.trim().is_empty() { None } else { Some(sudo) };
        }
        if let Some(program) = lookup(ENV_TRACER) {
            self.tracer.program = Some(program);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.tracer.timeout_secs = secs.trim().parse().map_err(|_| {
                HarnessError::Config(format!(
                    "{} must be an integer, got {:?}",
                    ENV_TIMEOUT_SECS, secs
                ))
            })?;
        }
        if let Some(keep) = lookup(ENV_KEEP_FILES) {
            self.tracer.keep_files = parse_flag(&keep).ok_or_else(|| {
                HarnessError::Config(format!(
                    "{} must be a boolean, got {:?}",
                    ENV_KEEP_FILES, keep
                ))
            })?;
        }
        if let Some(interpreter) = lookup(ENV_INTERPRETER) {
            self.target.interpreter = interpreter.split_whitespace().map(str::to_owned).collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.interpreter.is_empty() {
            return Err(HarnessError::Config("target.interpreter is empty".to_string()));
        }
        if self.tracer.engine == EngineKind::Command {
            CommandTemplate::new(self.tracer.argv.clone())?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.tracer.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Privilege prefix split into argv elements
    pub fn sudo_argv(&self) -> Vec<String> {
        self.tracer
            .sudo
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Build the configured engine
    pub fn engine(&self) -> Result<Box<dyn TraceEngine>> {
        let engine: Box<dyn TraceEngine> = match self.tracer.engine {
            EngineKind::Dtrace => {
                let mut dtrace = DTrace {
                    quiet: self.tracer.quiet,
                    ..DTrace::default()
                };
                if let Some(program) = &self.tracer.program {
                    dtrace.program = program.clone();
                }
                Box::new(dtrace)
            }
            EngineKind::Bpftrace => {
                let mut bpftrace = Bpftrace::default();
                if let Some(program) = &self.tracer.program {
                    bpftrace.program = program.clone();
                }
                Box::new(bpftrace)
            }
            EngineKind::Command => {
                let mut template = CommandTemplate::new(self.tracer.argv.clone())?;
                if let Some(prefix) = &self.tracer.notice_prefix {
                    template = template.with_notice_prefix(prefix.clone());
                }
                Box::new(template)
            }
        };
        Ok(engine)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
