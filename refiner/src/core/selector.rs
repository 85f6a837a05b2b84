//! Deterministic selection of fix contexts from a sibling set.

use std::collections::HashSet;

use crate::core::types::{AttemptNode, NodeId};
use crate::grid::Grid;
use crate::plan::SelectionSpec;

/// Survivors bundled into one downstream fix context, in rank order.
///
/// Groups are only built by this module and are never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<'a> {
    members: Vec<&'a AttemptNode>,
}

impl<'a> Group<'a> {
    /// Highest-ranked member; recorded as the parent of fix attempts.
    pub fn representative(&self) -> &'a AttemptNode {
        self.members[0]
    }

    pub fn members(&self) -> &[&'a AttemptNode] {
        &self.members
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|node| node.id).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Rank, de-duplicate, keep the first `top_k`, then pool.
pub fn select<'a>(siblings: &'a [AttemptNode], spec: &SelectionSpec) -> Vec<Group<'a>> {
    partition(survivors(siblings, spec, Some(spec.top_k)), spec.pool_size)
}

/// Like [`select`] without the `top_k` truncation.
pub fn select_all<'a>(siblings: &'a [AttemptNode], spec: &SelectionSpec) -> Vec<Group<'a>> {
    partition(survivors(siblings, spec, None), spec.pool_size)
}

/// Stable ranking: score descending, then generation order.
pub fn rank(siblings: &[AttemptNode]) -> Vec<&AttemptNode> {
    let mut ranked: Vec<&AttemptNode> = siblings.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    ranked
}

/// Ranked, de-duplicated survivors, truncated to `limit` when given.
pub fn survivors<'a>(
    siblings: &'a [AttemptNode],
    spec: &SelectionSpec,
    limit: Option<usize>,
) -> Vec<&'a AttemptNode> {
    let mut kept = rank(siblings);
    if spec.dedupe_by_code {
        let mut seen: HashSet<&str> = HashSet::new();
        kept.retain(|&node| seen.insert(node.program.as_str()));
    }
    if spec.dedupe_by_output {
        // Nodes without produced output have no signature and are never dropped.
        let mut seen: HashSet<&[Grid]> = HashSet::new();
        kept.retain(|&node| match node.output_signature() {
            Some(grids) => seen.insert(grids),
            None => true,
        });
    }
    if let Some(limit) = limit {
        kept.truncate(limit);
    }
    kept
}

/// Split ordered survivors into consecutive groups of `pool_size`.
///
/// Without a pool size every survivor is its own group. The last pool may be
/// smaller; no group is ever padded.
pub fn partition<'a>(survivors: Vec<&'a AttemptNode>, pool_size: Option<usize>) -> Vec<Group<'a>> {
    let size = pool_size.unwrap_or(1).max(1);
    survivors
        .chunks(size)
        .map(|chunk| Group {
            members: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Score;
    use crate::test_support::{attempt, attempt_with_output, failed_attempt, grid};

    fn ids(groups: &[Group<'_>]) -> Vec<Vec<u64>> {
        groups
            .iter()
            .map(|group| group.ids().into_iter().map(|id| id.0).collect())
            .collect()
    }

    #[test]
    fn ranks_by_score_then_generation_order() {
        let siblings = vec![
            attempt(1, Score::Graded(0.2), "a"),
            attempt(2, Score::Graded(0.9), "b"),
            attempt(3, Score::Graded(0.2), "c"),
            failed_attempt(4, "d"),
            attempt(5, Score::Graded(0.9), "e"),
        ];
        let ranked: Vec<u64> = rank(&siblings).iter().map(|node| node.id.0).collect();
        assert_eq!(ranked, vec![2, 5, 1, 3, 4]);
    }

    #[test]
    fn failures_tie_break_on_generation_order() {
        let siblings = vec![failed_attempt(7, "x"), failed_attempt(3, "y")];
        let groups = select(&siblings, &SelectionSpec::top(1));
        assert_eq!(ids(&groups), vec![vec![3]]);
    }

    #[test]
    fn top_k_limits_groups_and_never_exceeds_siblings() {
        let siblings: Vec<_> = (0..4)
            .map(|i| attempt(i, Score::Graded(i as f64), "p"))
            .collect();
        assert_eq!(select(&siblings, &SelectionSpec::top(2)).len(), 2);
        assert_eq!(select(&siblings, &SelectionSpec::top(10)).len(), 4);
        assert!(select(&siblings, &SelectionSpec::top(0)).is_empty());
    }

    #[test]
    fn dedupe_by_code_keeps_highest_ranked_copy() {
        let siblings = vec![
            attempt(1, Score::Graded(0.1), "same"),
            attempt(2, Score::Graded(0.8), "same"),
            attempt(3, Score::Graded(0.5), "other"),
        ];
        let groups = select(&siblings, &SelectionSpec::top(5).dedupe_code());
        assert_eq!(ids(&groups), vec![vec![2], vec![3]]);
    }

    #[test]
    fn dedupe_by_output_ignores_source_text() {
        let siblings = vec![
            attempt_with_output(1, Score::Graded(0.7), "first", vec![grid(&[&[1]])]),
            attempt_with_output(2, Score::Graded(0.6), "second", vec![grid(&[&[1]])]),
            attempt_with_output(3, Score::Graded(0.5), "third", vec![grid(&[&[2]])]),
            failed_attempt(4, "broken"),
            failed_attempt(5, "broken too"),
        ];
        let groups = select(&siblings, &SelectionSpec::top(5).dedupe_output());
        assert_eq!(ids(&groups), vec![vec![1], vec![3], vec![4], vec![5]]);
    }

    #[test]
    fn dedupe_applies_code_then_output_before_truncation() {
        let siblings = vec![
            attempt_with_output(1, Score::Graded(0.9), "a", vec![grid(&[&[1]])]),
            attempt_with_output(2, Score::Graded(0.8), "a", vec![grid(&[&[2]])]),
            attempt_with_output(3, Score::Graded(0.7), "b", vec![grid(&[&[1]])]),
            attempt_with_output(4, Score::Graded(0.6), "c", vec![grid(&[&[3]])]),
        ];
        let spec = SelectionSpec::top(2).dedupe_code().dedupe_output();
        assert_eq!(ids(&select(&siblings, &spec)), vec![vec![1], vec![4]]);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let siblings = vec![
            attempt_with_output(1, Score::Graded(0.9), "a", vec![grid(&[&[1]])]),
            attempt_with_output(2, Score::Graded(0.8), "a", vec![grid(&[&[2]])]),
            attempt_with_output(3, Score::Graded(0.7), "b", vec![grid(&[&[1]])]),
            attempt_with_output(4, Score::Graded(0.6), "c", vec![grid(&[&[3]])]),
        ];
        let spec = SelectionSpec::top(10).dedupe_code().dedupe_output();
        let once: Vec<AttemptNode> = survivors(&siblings, &spec, Some(spec.top_k))
            .into_iter()
            .cloned()
            .collect();
        let twice: Vec<AttemptNode> = survivors(&once, &spec, Some(spec.top_k))
            .into_iter()
            .cloned()
            .collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn pooling_partitions_survivors_exhaustively() {
        let siblings: Vec<_> = (0..6)
            .map(|i| attempt(i, Score::Graded(1.0 - i as f64 / 10.0), &format!("p{i}")))
            .collect();

        let by_three = select(&siblings, &SelectionSpec::top(6).pooled(3));
        assert_eq!(ids(&by_three), vec![vec![0, 1, 2], vec![3, 4, 5]]);

        let by_four = select(&siblings, &SelectionSpec::top(6).pooled(4));
        let sizes: Vec<usize> = by_four.iter().map(Group::len).collect();
        assert_eq!(sizes, vec![4, 2]);

        let mut seen: Vec<u64> = ids(&by_four).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn pooling_with_few_survivors_never_pads() {
        let siblings = vec![attempt(0, Score::Graded(0.5), "only")];
        let groups = select(&siblings, &SelectionSpec::top(5).pooled(3));
        assert_eq!(ids(&groups), vec![vec![0]]);
        assert_eq!(groups[0].representative().id.0, 0);
    }

    #[test]
    fn select_all_skips_truncation_only() {
        let siblings = vec![
            attempt(0, Score::Graded(0.1), "a"),
            attempt(1, Score::Graded(0.3), "a"),
            attempt(2, Score::Graded(0.2), "b"),
        ];
        let groups = select_all(&siblings, &SelectionSpec::top(0).dedupe_code());
        assert_eq!(ids(&groups), vec![vec![1], vec![2]]);
    }
}
