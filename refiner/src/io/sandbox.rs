//! Isolated execution of candidate programs.
//!
//! Each evaluation renders a self-contained Python script (driver preamble,
//! candidate source, serialized inputs) into a fresh temporary directory and
//! runs it in its own process with a cleared environment and a hard deadline.
//! The temporary directory and the child's whole process group are released
//! on every exit path, including the caller dropping the future.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

use crate::core::types::{CandidateProgram, ExecutionOutcome, millis};
use crate::grid::Grid;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const DRIVER_TEMPLATE: &str = include_str!("templates/driver.py.j2");
const DRIVER_NAME: &str = "driver.py";

/// Prefix of the single stdout line carrying the JSON-encoded results.
pub const RESULT_MARKER: &str = "TRANSFORM_RESULT:";

/// Longest failure message kept on an outcome.
const MESSAGE_LIMIT_CHARS: usize = 2_000;

/// Runs a candidate against input grids under a deadline.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        program: &CandidateProgram,
        inputs: &[Grid],
        deadline: Duration,
    ) -> ExecutionOutcome;
}

/// Sandbox settings (the `[sandbox]` table of `refiner.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter command; the script path is appended.
    pub interpreter: Vec<String>,
    /// Environment variables passed through to the child. Everything else is cleared.
    pub inherit_env: Vec<String>,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-B".to_string()],
            inherit_env: vec!["PATH".to_string(), "HOME".to_string()],
            output_limit_bytes: 4_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            bail!("sandbox.interpreter must be a non-empty array");
        }
        if self.output_limit_bytes == 0 {
            bail!("sandbox.output_limit_bytes must be > 0");
        }
        Ok(())
    }
}

/// Process-per-candidate evaluator.
#[derive(Debug)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    templates: Environment<'static>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let mut templates = Environment::new();
        templates
            .add_template(DRIVER_NAME, DRIVER_TEMPLATE)
            .context("load sandbox driver template")?;
        Ok(Self { config, templates })
    }

    /// Render the full script run by the child process.
    pub fn render_driver(&self, program: &CandidateProgram, inputs: &[Grid]) -> Result<String> {
        let inputs = serde_json::to_string(inputs).context("serialize input grids")?;
        let template = self.templates.get_template(DRIVER_NAME)?;
        let script = template.render(context! {
            program => program.as_str(),
            marker => RESULT_MARKER,
            inputs => inputs,
        })?;
        Ok(script)
    }

    #[instrument(skip_all, fields(inputs = inputs.len(), deadline_ms = millis(deadline)))]
    async fn run(
        &self,
        program: &CandidateProgram,
        inputs: &[Grid],
        deadline: Duration,
    ) -> Result<ExecutionOutcome> {
        let workdir = tempfile::Builder::new()
            .prefix("refiner-sandbox-")
            .tempdir()
            .context("create sandbox directory")?;
        let script_path = workdir.path().join("candidate.py");
        let script = self.render_driver(program, inputs)?;
        fs::write(&script_path, script)
            .with_context(|| format!("write sandbox script {}", script_path.display()))?;

        let mut cmd = Command::new(&self.config.interpreter[0]);
        cmd.args(&self.config.interpreter[1..])
            .arg(&script_path)
            .current_dir(workdir.path())
            .env_clear();
        for key in &self.config.inherit_env {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        let output =
            run_command_with_timeout(cmd, None, deadline, self.config.output_limit_bytes)
                .await
                .context("run sandbox process")?;
        let outcome = classify_output(&output, inputs.len(), deadline);
        debug!(outcome = ?outcome.kind(), latency_ms = millis(outcome.latency()), "sandbox evaluation finished");

        if let Err(err) = workdir.close() {
            warn!(err = %err, "failed to remove sandbox directory");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Evaluator for SandboxExecutor {
    async fn evaluate(
        &self,
        program: &CandidateProgram,
        inputs: &[Grid],
        deadline: Duration,
    ) -> ExecutionOutcome {
        match self.run(program, inputs, deadline).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(err = %format!("{err:#}"), "sandbox infrastructure failure");
                ExecutionOutcome::RuntimeFailure {
                    message: format!("sandbox: {err:#}"),
                    latency_ms: 0,
                }
            }
        }
    }
}

/// Classify a finished sandbox process.
///
/// - timed out: `Timeout` with latency equal to the deadline
/// - non-zero exit: `RuntimeFailure` carrying the stderr tail
/// - clean exit without exactly one parseable marker line, or with a result
///   count different from `expected_results`: `ProtocolFailure`
/// - any produced value that is not a valid grid: `RuntimeFailure`
pub fn classify_output(
    output: &CommandOutput,
    expected_results: usize,
    deadline: Duration,
) -> ExecutionOutcome {
    let latency_ms = millis(output.elapsed);
    if output.timed_out {
        return ExecutionOutcome::Timeout {
            latency_ms: millis(deadline),
        };
    }
    if !output.status.success() {
        let mut message = match output.status.code() {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let tail = output.stderr_tail(MESSAGE_LIMIT_CHARS);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&tail);
        }
        message.push_str(&output.stderr_truncated_notice("sandbox"));
        return ExecutionOutcome::RuntimeFailure {
            message: message.trim_end().to_string(),
            latency_ms,
        };
    }

    let protocol = |message: String| ExecutionOutcome::ProtocolFailure {
        message,
        latency_ms,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let payloads: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.strip_prefix(RESULT_MARKER))
        .collect();
    let payload = match payloads.as_slice() {
        [payload] => *payload,
        [] => return protocol("no result line on stdout".to_string()),
        many => return protocol(format!("{} result lines on stdout, expected 1", many.len())),
    };
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => return protocol(format!("parse result json: {err}")),
    };
    let Value::Array(items) = value else {
        return protocol("result payload is not a list".to_string());
    };
    if items.len() != expected_results {
        return protocol(format!(
            "expected {} results, got {}",
            expected_results,
            items.len()
        ));
    }

    let mut grids = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match Grid::from_json(item) {
            Ok(grid) => grids.push(grid),
            Err(err) => {
                return ExecutionOutcome::RuntimeFailure {
                    message: format!("malformed grid for input {index}: {err}"),
                    latency_ms,
                };
            }
        }
    }
    ExecutionOutcome::Success { grids, latency_ms }
}
