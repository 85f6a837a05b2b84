//! Shared deterministic types for the search core.
//!
//! These types define stable contracts between the scheduler, the selection
//! policy, and the sandbox. They carry no I/O handles and serialize to the JSON
//! emitted by `refiner run`.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::grid::Grid;
use crate::plan::GenerationParams;

/// Identifier of an attempt node. Ids increase in generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Source text returned by the generator. Never modified after generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateProgram(String);

impl CandidateProgram {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CandidateProgram {
    fn from(source: String) -> Self {
        Self(source)
    }
}

impl From<&str> for CandidateProgram {
    fn from(source: &str) -> Self {
        Self(source.to_string())
    }
}

/// Result of running one candidate against a set of inputs.
///
/// Exactly one variant holds per evaluation and latency is always recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every input produced a valid grid, in input order.
    Success { grids: Vec<Grid>, latency_ms: u64 },
    /// The program raised, failed to load, or returned a malformed grid.
    RuntimeFailure { message: String, latency_ms: u64 },
    /// The deadline expired; latency equals the deadline.
    Timeout { latency_ms: u64 },
    /// The process exited cleanly but no result could be located or parsed.
    ProtocolFailure { message: String, latency_ms: u64 },
}

/// Payload-free discriminant of [`ExecutionOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RuntimeFailure,
    Timeout,
    ProtocolFailure,
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success { .. } => OutcomeKind::Success,
            Self::RuntimeFailure { .. } => OutcomeKind::RuntimeFailure,
            Self::Timeout { .. } => OutcomeKind::Timeout,
            Self::ProtocolFailure { .. } => OutcomeKind::ProtocolFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Produced grids, present only on success.
    pub fn grids(&self) -> Option<&[Grid]> {
        match self {
            Self::Success { grids, .. } => Some(grids),
            _ => None,
        }
    }

    pub fn latency(&self) -> Duration {
        let ms = match self {
            Self::Success { latency_ms, .. }
            | Self::RuntimeFailure { latency_ms, .. }
            | Self::Timeout { latency_ms }
            | Self::ProtocolFailure { latency_ms, .. } => *latency_ms,
        };
        Duration::from_millis(ms)
    }

    /// Diagnostic text for failures.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::RuntimeFailure { message, .. } | Self::ProtocolFailure { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }
}

/// Whole milliseconds of `duration`, saturating.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Totally ordered candidate quality.
///
/// `Failed` ranks below every graded score. Graded scores compare with
/// `f64::total_cmp`, so the order is total even for unusual float values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Score {
    Failed,
    Graded(f64),
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Failed, Self::Failed) => Ordering::Equal,
            (Self::Failed, Self::Graded(_)) => Ordering::Less,
            (Self::Graded(_), Self::Failed) => Ordering::Greater,
            (Self::Graded(a), Self::Graded(b)) => a.total_cmp(b),
        }
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

/// Where a node came from in the configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Generated without reference to prior attempts.
    Root { root: usize },
    /// Generated from a fix context.
    ///
    /// `edge_path` indexes `roots[root].edges`, then each nested `children`
    /// list. `parents` lists the whole group in rank order.
    Fix {
        root: usize,
        edge_path: Vec<usize>,
        fix_config: usize,
        parents: Vec<NodeId>,
    },
}

/// One evaluated candidate. Written exactly once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptNode {
    pub id: NodeId,
    pub depth: u32,
    pub parent_id: Option<NodeId>,
    pub program: CandidateProgram,
    pub outcome: ExecutionOutcome,
    pub score: Score,
    pub params: GenerationParams,
    pub provenance: Provenance,
}

impl AttemptNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Produced grids used for output de-duplication.
    pub fn output_signature(&self) -> Option<&[Grid]> {
        self.outcome.grids()
    }
}
