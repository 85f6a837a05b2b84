//! Generator abstraction for candidate program production.
//!
//! The [`Generator`] trait decouples the scheduler from the concrete model
//! backend. [`CommandGenerator`] delegates to an external command speaking a
//! small JSON protocol; tests use scripted generators that return
//! predetermined programs without spawning processes.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::{AttemptNode, CandidateProgram};
use crate::io::process::run_command_with_timeout;
use crate::plan::GenerationParams;
use crate::task::Task;

/// What a generation call is conditioned on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptContext<'a> {
    /// Fresh attempt with no prior candidates.
    Root,
    /// Repair attempt. `attempts` is the group in rank order, carrying each
    /// member's program, outcome, and score.
    Fix { attempts: Vec<&'a AttemptNode> },
}

/// One call to the generator.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub task: &'a Task,
    pub params: &'a GenerationParams,
    /// Candidates wanted from this call.
    pub count: usize,
    pub context: PromptContext<'a>,
}

impl GenerationRequest<'_> {
    pub fn is_fix(&self) -> bool {
        matches!(self.context, PromptContext::Fix { .. })
    }
}

/// Abstraction over candidate generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce up to `request.count` programs. An `Err` means the whole call
    /// failed and its candidates are absent.
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<CandidateProgram>>;
}

/// Generator settings (the `[generator]` table of `refiner.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a request on stdin and writes `{"programs": [...]}`.
    pub command: Vec<String>,
    /// Per-call wall-clock limit.
    pub timeout_secs: u64,
    /// Truncate captured generator output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 4_000_000,
        }
    }
}

impl GeneratorConfig {
    /// Check settings that must hold even when no generator is configured.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("generator.timeout_secs must be > 0");
        }
        if self.output_limit_bytes == 0 {
            bail!("generator.output_limit_bytes must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    programs: Vec<String>,
}

/// Generator that spawns the configured command once per call.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    config: GeneratorConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        if config.command.is_empty() || config.command[0].trim().is_empty() {
            bail!("generator.command must be a non-empty array");
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(count = request.count, fix = request.is_fix(), model = %request.params.model))]
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<CandidateProgram>> {
        let payload = serde_json::to_vec(request).context("serialize generation request")?;
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output =
            run_command_with_timeout(cmd, Some(payload), timeout, self.config.output_limit_bytes)
                .await
                .context("run generator command")?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "generator timed out");
            bail!("generator timed out after {timeout:?}");
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            bail!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(500)
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "generator response exceeded {} bytes",
                self.config.output_limit_bytes
            );
        }

        let response: GenerationResponse =
            serde_json::from_slice(&output.stdout).context("parse generator response")?;
        let mut programs: Vec<CandidateProgram> = response
            .programs
            .into_iter()
            .map(CandidateProgram::from)
            .collect();
        if programs.len() > request.count {
            debug!(
                returned = programs.len(),
                requested = request.count,
                "dropping surplus programs"
            );
            programs.truncate(request.count);
        }
        Ok(programs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TestInput;
    use crate::test_support::{failed_attempt, grid, task_1x1};

    #[test]
    fn request_serializes_context_and_params() {
        let task = task_1x1(1, 2);
        let params = GenerationParams::new("model-a", 0.5).with_option("use_ascii", true);
        let parent = failed_attempt(3, "def transform(g): raise ValueError");
        let request = GenerationRequest {
            task: &task,
            params: &params,
            count: 2,
            context: PromptContext::Fix {
                attempts: vec![&parent],
            },
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["count"], 2);
        assert_eq!(json["params"]["model"], "model-a");
        assert_eq!(json["params"]["options"]["use_ascii"], true);
        assert_eq!(json["context"]["kind"], "fix");
        assert_eq!(json["context"]["attempts"][0]["id"], 3);
        assert_eq!(json["task"]["train"][0]["input"], serde_json::json!([[1]]));
        assert!(request.is_fix());
    }

    #[test]
    fn request_omits_test_answers() {
        let mut task = task_1x1(1, 2);
        task.test = vec![TestInput {
            input: grid(&[&[3]]),
            output: Some(grid(&[&[7]])),
        }];
        let params = GenerationParams::default();
        let request = GenerationRequest {
            task: &task,
            params: &params,
            count: 1,
            context: PromptContext::Root,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["task"]["test"][0]["input"], serde_json::json!([[3]]));
        assert!(json["task"]["test"][0].get("output").is_none(), "{json}");
    }

    #[test]
    fn new_requires_a_command() {
        assert!(CommandGenerator::new(GeneratorConfig::default()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_reads_programs_and_truncates() {
        let config = GeneratorConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"programs": ["a", "b", "c"]}'"#.to_string(),
            ],
            ..GeneratorConfig::default()
        };
        let generator = CommandGenerator::new(config).expect("generator");
        let task = task_1x1(1, 2);
        let params = GenerationParams::default();
        let request = GenerationRequest {
            task: &task,
            params: &params,
            count: 2,
            context: PromptContext::Root,
        };
        let programs = generator.generate(&request).await.expect("generate");
        assert_eq!(
            programs,
            vec![CandidateProgram::from("a"), CandidateProgram::from("b")]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_reports_failures() {
        let task = task_1x1(1, 2);
        let params = GenerationParams::default();
        let request = GenerationRequest {
            task: &task,
            params: &params,
            count: 1,
            context: PromptContext::Root,
        };
        for script in ["cat >/dev/null; exit 3", "cat >/dev/null; echo not-json"] {
            let config = GeneratorConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                ..GeneratorConfig::default()
            };
            let generator = CommandGenerator::new(config).expect("generator");
            assert!(generator.generate(&request).await.is_err(), "{script}");
        }
    }
}
