//! Test-only helpers: node constructors and scripted collaborators.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::core::scoring::Scorer;
use crate::core::types::{
    AttemptNode, CandidateProgram, ExecutionOutcome, NodeId, Provenance, Score,
};
use crate::grid::Grid;
use crate::io::generator::{GenerationRequest, Generator, PromptContext};
use crate::io::sandbox::Evaluator;
use crate::plan::GenerationParams;
use crate::task::{Example, Task};

/// Build a grid from literal rows. Panics on ragged input.
pub fn grid(rows: &[&[u8]]) -> Grid {
    Grid::new(rows.iter().map(|row| row.to_vec()).collect()).expect("rectangular grid")
}

/// One-example task mapping `[[input]]` to `[[output]]`.
pub fn task_1x1(input: u8, output: u8) -> Task {
    Task {
        train: vec![Example {
            input: grid(&[&[input]]),
            output: grid(&[&[output]]),
        }],
        test: Vec::new(),
    }
}

/// Root node with a successful empty output and the given score.
pub fn attempt(id: u64, score: Score, program: &str) -> AttemptNode {
    attempt_with_output(id, score, program, Vec::new())
}

/// Root node with explicit produced grids.
pub fn attempt_with_output(id: u64, score: Score, program: &str, grids: Vec<Grid>) -> AttemptNode {
    AttemptNode {
        id: NodeId(id),
        depth: 0,
        parent_id: None,
        program: CandidateProgram::from(program),
        outcome: ExecutionOutcome::Success {
            grids,
            latency_ms: 1,
        },
        score,
        params: GenerationParams::default(),
        provenance: Provenance::Root { root: 0 },
    }
}

/// Root node whose evaluation raised.
pub fn failed_attempt(id: u64, program: &str) -> AttemptNode {
    AttemptNode {
        outcome: ExecutionOutcome::RuntimeFailure {
            message: "boom".to_string(),
            latency_ms: 1,
        },
        score: Score::Failed,
        ..attempt(id, Score::Failed, program)
    }
}

/// Depth-1 fix node generated from `parents` (first parent is the representative).
pub fn fix_attempt(id: u64, parents: &[u64], program: &str) -> AttemptNode {
    let parents: Vec<NodeId> = parents.iter().copied().map(NodeId).collect();
    AttemptNode {
        depth: 1,
        parent_id: parents.first().copied(),
        provenance: Provenance::Fix {
            root: 0,
            edge_path: vec![0],
            fix_config: 0,
            parents,
        },
        ..attempt(id, Score::Graded(0.0), program)
    }
}

/// A generator call observed by [`ScriptedGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Ids of the fix context, empty for root calls.
    pub parents: Vec<NodeId>,
    pub count: usize,
    pub model: String,
}

/// Generator returning queued root programs and synthetic fix programs.
///
/// Root calls pop from the root queue (falling back to `value:0`). Fix calls
/// pop from the fix queue when it is non-empty, otherwise produce
/// `fix[<parent ids>]/<i>`, which the [`FakeEvaluator`] treats as `[[0]]`.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    roots: Mutex<VecDeque<String>>,
    fixes: Mutex<VecDeque<String>>,
    failing_parents: HashSet<NodeId>,
    fix_delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots<I, P>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.roots = Mutex::new(programs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_fixes<I, P>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.fixes = Mutex::new(programs.into_iter().map(Into::into).collect());
        self
    }

    /// Fail every fix call whose context contains `id`.
    pub fn failing_for(mut self, id: u64) -> Self {
        self.failing_parents.insert(NodeId(id));
        self
    }

    /// Sleep before answering fix calls.
    pub fn with_fix_delay(mut self, delay: Duration) -> Self {
        self.fix_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fix_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| !call.parents.is_empty())
            .collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<CandidateProgram>> {
        let parents: Vec<NodeId> = match &request.context {
            PromptContext::Root => Vec::new(),
            PromptContext::Fix { attempts } => attempts.iter().map(|node| node.id).collect(),
        };
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                parents: parents.clone(),
                count: request.count,
                model: request.params.model.clone(),
            });

        if parents.is_empty() {
            let mut queue = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
            let programs = (0..request.count)
                .map(|_| {
                    CandidateProgram::from(queue.pop_front().unwrap_or_else(|| "value:0".into()))
                })
                .collect();
            return Ok(programs);
        }

        if let Some(delay) = self.fix_delay {
            tokio::time::sleep(delay).await;
        }
        if parents.iter().any(|id| self.failing_parents.contains(id)) {
            bail!("scripted failure for {parents:?}");
        }
        let mut queue = self.fixes.lock().unwrap_or_else(PoisonError::into_inner);
        let label = parents
            .iter()
            .map(|id| id.0.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let programs = (0..request.count)
            .map(|index| {
                CandidateProgram::from(
                    queue
                        .pop_front()
                        .unwrap_or_else(|| format!("fix[{label}]/{index}")),
                )
            })
            .collect();
        Ok(programs)
    }
}

/// Evaluator interpreting tiny scripted programs without spawning processes.
///
/// - `value:N` succeeds with `[[N]]` for every input
/// - `raise` is a runtime failure, `hang` a timeout, `garbage` a protocol failure
/// - anything else succeeds with `[[0]]`
#[derive(Debug, Default)]
pub struct FakeEvaluator;

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(
        &self,
        program: &CandidateProgram,
        inputs: &[Grid],
        deadline: Duration,
    ) -> ExecutionOutcome {
        let source = program.as_str();
        if let Some(value) = source.strip_prefix("value:") {
            let value: u8 = value.trim().parse().unwrap_or(0);
            return ExecutionOutcome::Success {
                grids: vec![grid(&[&[value]]); inputs.len()],
                latency_ms: 1,
            };
        }
        match source {
            "raise" => ExecutionOutcome::RuntimeFailure {
                message: "ValueError: scripted".to_string(),
                latency_ms: 1,
            },
            "hang" => ExecutionOutcome::Timeout {
                latency_ms: crate::core::types::millis(deadline),
            },
            "garbage" => ExecutionOutcome::ProtocolFailure {
                message: "no result line on stdout".to_string(),
                latency_ms: 1,
            },
            _ => ExecutionOutcome::Success {
                grids: vec![grid(&[&[0]]); inputs.len()],
                latency_ms: 1,
            },
        }
    }
}

/// Scores a success by its first produced cell; `9` solves.
#[derive(Debug, Default)]
pub struct ValueScorer;

impl Scorer for ValueScorer {
    fn score(&self, outcome: &ExecutionOutcome, _expected: &[Grid]) -> Score {
        match outcome.grids() {
            Some(grids) => {
                let value = grids
                    .first()
                    .and_then(|grid| grid.rows().first())
                    .and_then(|row| row.first())
                    .copied()
                    .unwrap_or(0);
                Score::Graded(f64::from(value))
            }
            None => Score::Failed,
        }
    }

    fn is_solved(&self, score: &Score) -> bool {
        matches!(score, Score::Graded(value) if *value >= 9.0)
    }
}
