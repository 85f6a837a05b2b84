//! Scoring seam and the default exact-match scorer.

use crate::core::types::{ExecutionOutcome, Score};
use crate::grid::Grid;

/// Partial credit ceiling for a same-shape grid that is not an exact match,
/// so only exact matches can reach a perfect score.
const PARTIAL_CREDIT: f64 = 0.99;

/// Turns an execution outcome into a comparable score.
pub trait Scorer: Send + Sync {
    /// Score produced grids against `expected`, which covers the leading
    /// produced grids. Failed outcomes must score [`Score::Failed`].
    fn score(&self, outcome: &ExecutionOutcome, expected: &[Grid]) -> Score;

    /// Whether `score` means the puzzle is solved.
    fn is_solved(&self, _score: &Score) -> bool {
        false
    }
}

/// Mean per-example credit: 1.0 for an exact match, `0.99 × cell accuracy`
/// for a same-shape miss, 0.0 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchScorer;

impl Scorer for ExactMatchScorer {
    fn score(&self, outcome: &ExecutionOutcome, expected: &[Grid]) -> Score {
        let Some(produced) = outcome.grids() else {
            return Score::Failed;
        };
        if expected.is_empty() {
            return Score::Graded(0.0);
        }
        let total: f64 = expected
            .iter()
            .enumerate()
            .map(|(index, want)| produced.get(index).map_or(0.0, |got| credit(got, want)))
            .sum();
        Score::Graded(total / expected.len() as f64)
    }

    fn is_solved(&self, score: &Score) -> bool {
        matches!(score, Score::Graded(value) if *value >= 1.0)
    }
}

fn credit(got: &Grid, want: &Grid) -> f64 {
    if got == want {
        return 1.0;
    }
    match got.matching_cells(want) {
        Some(matching) if want.cell_count() > 0 => {
            PARTIAL_CREDIT * matching as f64 / want.cell_count() as f64
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::grid;

    fn success(grids: Vec<Grid>) -> ExecutionOutcome {
        ExecutionOutcome::Success {
            grids,
            latency_ms: 1,
        }
    }

    #[test]
    fn failures_score_failed() {
        let outcome = ExecutionOutcome::Timeout { latency_ms: 10 };
        assert_eq!(
            ExactMatchScorer.score(&outcome, &[grid(&[&[1]])]),
            Score::Failed
        );
    }

    #[test]
    fn exact_matches_solve() {
        let expected = vec![grid(&[&[1, 2]]), grid(&[&[3]])];
        // Trailing test predictions are ignored.
        let outcome = success(vec![grid(&[&[1, 2]]), grid(&[&[3]]), grid(&[&[9]])]);
        let score = ExactMatchScorer.score(&outcome, &expected);
        assert_eq!(score, Score::Graded(1.0));
        assert!(ExactMatchScorer.is_solved(&score));
    }

    #[test]
    fn partial_matches_rank_between_failure_and_solve() {
        let expected = vec![grid(&[&[1, 2], &[3, 4]])];
        let close = ExactMatchScorer.score(&success(vec![grid(&[&[1, 2], &[3, 0]])]), &expected);
        let wrong_shape = ExactMatchScorer.score(&success(vec![grid(&[&[1]])]), &expected);
        assert!(close > wrong_shape);
        assert!(wrong_shape > Score::Failed);
        assert!(!ExactMatchScorer.is_solved(&close));
    }
}
