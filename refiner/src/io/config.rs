//! Search configuration stored in `refiner.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Budget;
use crate::io::generator::GeneratorConfig;
use crate::io::sandbox::SandboxConfig;
use crate::search::SearchOptions;

/// Default config file name, relative to the working directory.
pub const CONFIG_FILE: &str = "refiner.toml";

/// Search configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a single local run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    /// Wall-clock deadline for one sandbox evaluation.
    pub eval_timeout_ms: u64,

    /// Truncate sandbox stdout/stderr beyond this many bytes. Overrides
    /// `sandbox.output_limit_bytes`.
    pub output_limit_bytes: usize,

    /// Generator calls allowed in flight at once.
    pub max_concurrent_generations: usize,

    /// Sandbox processes allowed in flight at once.
    pub max_concurrent_evaluations: usize,

    /// Largest candidate count requested from a single generator call.
    pub generation_batch_size: usize,

    /// Skip remaining work once a solving candidate appears.
    pub stop_when_solved: bool,

    pub sandbox: SandboxConfig,
    pub generator: GeneratorConfig,
    pub budget: BudgetConfig,
}

/// Run-wide limits. Absent keys mean unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            eval_timeout_ms: 5_000,
            output_limit_bytes: 4_000_000,
            max_concurrent_generations: 8,
            max_concurrent_evaluations: 8,
            generation_batch_size: 1,
            stop_when_solved: true,
            sandbox: SandboxConfig::default(),
            generator: GeneratorConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_timeout_ms == 0 {
            return Err(anyhow!("eval_timeout_ms must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_concurrent_generations == 0 {
            return Err(anyhow!("max_concurrent_generations must be > 0"));
        }
        if self.max_concurrent_evaluations == 0 {
            return Err(anyhow!("max_concurrent_evaluations must be > 0"));
        }
        if self.generation_batch_size == 0 {
            return Err(anyhow!("generation_batch_size must be > 0"));
        }
        if self.budget.max_duration_secs == Some(0) {
            return Err(anyhow!("budget.max_duration_secs must be > 0"));
        }
        self.sandbox.validate()?;
        self.generator.validate()?;
        Ok(())
    }

    /// Scheduler options derived from this config.
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            eval_deadline: Duration::from_millis(self.eval_timeout_ms),
            max_concurrent_generations: self.max_concurrent_generations,
            max_concurrent_evaluations: self.max_concurrent_evaluations,
            generation_batch_size: self.generation_batch_size,
            stop_when_solved: self.stop_when_solved,
            budget: Budget {
                max_attempts: self.budget.max_attempts,
                max_duration: self.budget.max_duration_secs.map(Duration::from_secs),
                max_depth: self.budget.max_depth,
            },
        }
    }

    /// Sandbox settings with the top-level output limit applied.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            output_limit_bytes: self.output_limit_bytes,
            ..self.sandbox.clone()
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SearchConfig::default()`.
pub fn load_config(path: &Path) -> Result<SearchConfig> {
    if !path.exists() {
        let cfg = SearchConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SearchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SearchConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
