//! Tree scheduler: drives generation, evaluation, and selection level by level.
//!
//! # Lifecycle
//!
//! For each root of the plan, in order:
//!
//! 1. **Roots**: request `attempts` fresh candidates, evaluate them, append
//!    them to the node log.
//! 2. **Edges**: each edge attached to the root selects groups from the root
//!    population and requests fix candidates for every group and fix config.
//! 3. **Recurse**: the fix candidates produced for one group form the sibling
//!    set for each of that edge's children, processed one level deeper.
//!
//! Every level is a barrier: all generation calls of the level complete
//! before node ids are assigned (in request order), then all candidates of
//! the level are evaluated concurrently. Generation failures leave candidates
//! absent and never affect siblings. Evaluation failures are ordinary nodes.
//!
//! The run stops when no edge work remains, the attempt or time budget runs
//! out, or (with `stop_when_solved`) a level produces a solving candidate.
//! Nodes evaluated before a stop are always kept.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{AttemptBudget, Budget};
use crate::core::invariants::validate_plan;
use crate::core::scoring::Scorer;
use crate::core::selector::{Group, select, select_all};
use crate::core::types::{
    AttemptNode, CandidateProgram, ExecutionOutcome, NodeId, OutcomeKind, Provenance,
};
use crate::grid::Grid;
use crate::io::generator::{GenerationRequest, Generator, PromptContext};
use crate::io::sandbox::Evaluator;
use crate::plan::{GenerationParams, RefinementEdge, SearchPlan};
use crate::task::Task;

/// Scheduler knobs that are not part of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Deadline applied to every sandbox evaluation.
    pub eval_deadline: Duration,
    pub max_concurrent_generations: usize,
    pub max_concurrent_evaluations: usize,
    /// Largest candidate count requested from one generator call.
    pub generation_batch_size: usize,
    pub stop_when_solved: bool,
    pub budget: Budget,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            eval_deadline: Duration::from_secs(5),
            max_concurrent_generations: 8,
            max_concurrent_evaluations: 8,
            generation_batch_size: 1,
            stop_when_solved: true,
            budget: Budget::default(),
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.eval_deadline.is_zero() {
            errors.push("options: eval_deadline must be > 0".to_string());
        }
        if self.max_concurrent_generations == 0 {
            errors.push("options: max_concurrent_generations must be > 0".to_string());
        }
        if self.max_concurrent_evaluations == 0 {
            errors.push("options: max_concurrent_evaluations must be > 0".to_string());
        }
        if self.generation_batch_size == 0 {
            errors.push("options: generation_batch_size must be > 0".to_string());
        }
        if self.budget.max_duration.is_some_and(|limit| limit.is_zero()) {
            errors.push("options: budget.max_duration must be > 0".to_string());
        }
        errors
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// No edge work remained.
    Completed,
    /// `stop_when_solved` was set and `node` solved the task.
    Solved { node: NodeId },
    AttemptBudgetExhausted,
    TimeBudgetExhausted,
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    pub levels: usize,
    pub generation_calls: usize,
    pub generation_failures: usize,
    pub candidates_requested: usize,
    pub candidates_generated: usize,
    pub succeeded: usize,
    pub runtime_failures: usize,
    pub timeouts: usize,
    pub protocol_failures: usize,
}

/// Complete result of a run: every node, including failed branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub termination: Termination,
    /// Lowest-id node the scorer reports as solved, if any.
    pub solved: Option<NodeId>,
    pub stats: SearchStats,
    /// All nodes, sorted by id.
    pub nodes: Vec<AttemptNode>,
}

impl SearchOutcome {
    pub fn roots(&self) -> impl Iterator<Item = &AttemptNode> {
        self.nodes.iter().filter(|node| node.is_root())
    }

    pub fn at_depth(&self, depth: u32) -> impl Iterator<Item = &AttemptNode> {
        self.nodes.iter().filter(move |node| node.depth == depth)
    }

    pub fn node(&self, id: NodeId) -> Option<&AttemptNode> {
        self.nodes
            .binary_search_by_key(&id, |node| node.id)
            .ok()
            .map(|index| &self.nodes[index])
    }

    /// Highest-scoring node; the earliest wins ties.
    pub fn best(&self) -> Option<&AttemptNode> {
        self.nodes
            .iter()
            .max_by(|a, b| a.score.cmp(&b.score).then_with(|| b.id.cmp(&a.id)))
    }
}

/// One search run over a task with injected collaborators.
pub struct Search<'a, G, E, S> {
    task: &'a Task,
    generator: &'a G,
    evaluator: &'a E,
    scorer: &'a S,
    options: SearchOptions,
    inputs: Vec<Grid>,
    expected: Vec<Grid>,
}

impl<'a, G, E, S> Search<'a, G, E, S>
where
    G: Generator,
    E: Evaluator,
    S: Scorer,
{
    pub fn new(
        task: &'a Task,
        generator: &'a G,
        evaluator: &'a E,
        scorer: &'a S,
        options: SearchOptions,
    ) -> Self {
        Self {
            task,
            generator,
            evaluator,
            scorer,
            options,
            inputs: task.inputs(),
            expected: task.expected_outputs(),
        }
    }

    /// Run the whole plan.
    ///
    /// Returns `Err` only for configuration errors, before any generation.
    #[instrument(skip_all, fields(roots = plan.roots.len()))]
    pub async fn run(&self, plan: &SearchPlan) -> Result<SearchOutcome> {
        let mut errors = validate_plan(plan);
        errors.extend(self.options.validate());
        if let Err(err) = self.task.validate() {
            errors.push(format!("task: {err}"));
        }
        if !errors.is_empty() {
            bail!("invalid search plan:\n- {}", errors.join("\n- "));
        }

        let state = RunState::new(&self.options);
        let drive = self.drive(plan, &state);
        let termination = match self.options.budget.max_duration {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(termination) => termination,
                Err(_) => {
                    warn!(limit_ms = limit.as_millis() as u64, "time budget exhausted");
                    Termination::TimeBudgetExhausted
                }
            },
            None => drive.await,
        };

        let nodes = state.log.drain_sorted();
        let solved = nodes
            .iter()
            .find(|node| self.scorer.is_solved(&node.score))
            .map(|node| node.id);
        let stats = state.stats(&nodes);
        info!(
            ?termination,
            nodes = nodes.len(),
            solved = solved.is_some(),
            "search finished"
        );
        Ok(SearchOutcome {
            termination,
            solved,
            stats,
            nodes,
        })
    }

    async fn drive(&self, plan: &SearchPlan, state: &RunState) -> Termination {
        let mut run_roots: Vec<AttemptNode> = Vec::new();

        for (root_index, root) in plan.roots.iter().enumerate() {
            let mut calls = Vec::new();
            for count in batches(root.attempts, self.options.generation_batch_size) {
                let granted = state.budget.reserve(count);
                if granted > 0 {
                    calls.push(GenerationCall {
                        origin: Origin::Root,
                        params: &root.params,
                        count: granted,
                    });
                }
            }
            let produced = self.run_level(root_index, 0, calls, &[], state).await;
            let roots: Vec<AttemptNode> = produced.into_iter().map(|(_, node)| node).collect();
            if let Some(stop) = self.stop_reason(&roots, state) {
                return stop;
            }
            run_roots.extend(roots.iter().cloned());

            let siblings = if root.include_all_attempts_in_fixes {
                Arc::new(run_roots.clone())
            } else {
                Arc::new(roots)
            };
            let mut frontier: Vec<EdgeWork<'_>> = root
                .edges
                .iter()
                .enumerate()
                .map(|(index, edge)| EdgeWork {
                    edge,
                    edge_path: vec![index],
                    siblings: Arc::clone(&siblings),
                    depth: 1,
                    select_all: root.include_all_attempts_in_fixes,
                })
                .collect();

            while !frontier.is_empty() {
                if let Some(max_depth) = self.options.budget.max_depth {
                    frontier.retain(|work| work.depth <= max_depth);
                    if frontier.is_empty() {
                        debug!(max_depth, "depth limit reached");
                        break;
                    }
                }
                let depth = frontier[0].depth;
                let next = {
                    let contexts: Vec<FixContext<'_, '_>> = frontier
                        .iter()
                        .flat_map(|work| {
                            let groups = if work.select_all {
                                select_all(&work.siblings, &work.edge.selection)
                            } else {
                                select(&work.siblings, &work.edge.selection)
                            };
                            groups.into_iter().map(move |group| FixContext { work, group })
                        })
                        .collect();
                    let calls = self.fix_calls(&contexts, state);
                    let produced = self
                        .run_level(root_index, depth, calls, &contexts, state)
                        .await;

                    let mut next = Vec::new();
                    for (index, context) in contexts.iter().enumerate() {
                        let edge = context.work.edge;
                        if edge.is_leaf() {
                            continue;
                        }
                        let group_nodes: Vec<AttemptNode> = produced
                            .iter()
                            .filter(|(origin, _)| origin.context() == Some(index))
                            .map(|(_, node)| node.clone())
                            .collect();
                        if group_nodes.is_empty() {
                            continue;
                        }
                        let group_nodes = Arc::new(group_nodes);
                        for (child_index, child) in edge.children.iter().enumerate() {
                            let mut edge_path = context.work.edge_path.clone();
                            edge_path.push(child_index);
                            next.push(EdgeWork {
                                edge: child,
                                edge_path,
                                siblings: Arc::clone(&group_nodes),
                                depth: depth + 1,
                                select_all: false,
                            });
                        }
                    }

                    let level: Vec<AttemptNode> =
                        produced.into_iter().map(|(_, node)| node).collect();
                    if let Some(stop) = self.stop_reason(&level, state) {
                        return stop;
                    }
                    next
                };
                frontier = next;
            }
        }

        if state.budget.is_exhausted() {
            Termination::AttemptBudgetExhausted
        } else {
            Termination::Completed
        }
    }

    /// Requests for one edge level, in context → fix config → batch order.
    fn fix_calls<'p>(
        &self,
        contexts: &[FixContext<'p, '_>],
        state: &RunState,
    ) -> Vec<GenerationCall<'p>> {
        let mut calls = Vec::new();
        for (index, context) in contexts.iter().enumerate() {
            let edge: &'p RefinementEdge = context.work.edge;
            for (fix_index, fix) in edge.fix_configs.iter().enumerate() {
                for count in batches(fix.attempts, self.options.generation_batch_size) {
                    let granted = state.budget.reserve(count);
                    if granted == 0 {
                        continue;
                    }
                    calls.push(GenerationCall {
                        origin: Origin::Fix {
                            context: index,
                            fix_config: fix_index,
                        },
                        params: &fix.params,
                        count: granted,
                    });
                }
            }
        }
        calls
    }

    #[instrument(skip_all, fields(root = root_index, depth = depth, calls = calls.len()))]
    async fn run_level(
        &self,
        root_index: usize,
        depth: u32,
        calls: Vec<GenerationCall<'_>>,
        contexts: &[FixContext<'_, '_>],
        state: &RunState,
    ) -> Vec<(Origin, AttemptNode)> {
        if calls.is_empty() {
            return Vec::new();
        }
        state.levels.fetch_add(1, Ordering::Relaxed);

        let generated = join_all(
            calls
                .iter()
                .map(|call| self.generate(call, contexts, state)),
        )
        .await;

        let mut pending = Vec::new();
        for (call, programs) in calls.iter().zip(generated) {
            for program in programs {
                let (parent_id, provenance) = match call.origin {
                    Origin::Root => (None, Provenance::Root { root: root_index }),
                    Origin::Fix {
                        context,
                        fix_config,
                    } => {
                        let group = &contexts[context].group;
                        (
                            Some(group.representative().id),
                            Provenance::Fix {
                                root: root_index,
                                edge_path: contexts[context].work.edge_path.clone(),
                                fix_config,
                                parents: group.ids(),
                            },
                        )
                    }
                };
                pending.push(PendingNode {
                    origin: call.origin,
                    id: state.next_id(),
                    depth,
                    parent_id,
                    program,
                    params: call.params,
                    provenance,
                });
            }
        }
        debug!(candidates = pending.len(), "generation barrier reached");

        join_all(
            pending
                .into_iter()
                .map(|pending| self.evaluate(pending, state)),
        )
        .await
    }

    async fn generate(
        &self,
        call: &GenerationCall<'_>,
        contexts: &[FixContext<'_, '_>],
        state: &RunState,
    ) -> Vec<CandidateProgram> {
        let context = match call.origin {
            Origin::Root => PromptContext::Root,
            Origin::Fix { context, .. } => PromptContext::Fix {
                attempts: contexts[context].group.members().to_vec(),
            },
        };
        let request = GenerationRequest {
            task: self.task,
            params: call.params,
            count: call.count,
            context,
        };

        let Ok(_permit) = state.generation_slots.acquire().await else {
            warn!("generation slots closed");
            return Vec::new();
        };
        state.generation_calls.fetch_add(1, Ordering::Relaxed);
        state
            .candidates_requested
            .fetch_add(call.count, Ordering::Relaxed);
        match self.generator.generate(&request).await {
            Ok(mut programs) => {
                programs.truncate(call.count);
                state
                    .candidates_generated
                    .fetch_add(programs.len(), Ordering::Relaxed);
                programs
            }
            Err(err) => {
                state.generation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(err = %format!("{err:#}"), count = call.count, fix = request.is_fix(), "generation failed");
                Vec::new()
            }
        }
    }

    async fn evaluate(&self, pending: PendingNode<'_>, state: &RunState) -> (Origin, AttemptNode) {
        let outcome = match state.evaluation_slots.acquire().await {
            Ok(_permit) => {
                self.evaluator
                    .evaluate(&pending.program, &self.inputs, self.options.eval_deadline)
                    .await
            }
            Err(_) => ExecutionOutcome::RuntimeFailure {
                message: "sandbox: evaluation slots closed".to_string(),
                latency_ms: 0,
            },
        };
        let score = self.scorer.score(&outcome, &self.expected);
        let node = AttemptNode {
            id: pending.id,
            depth: pending.depth,
            parent_id: pending.parent_id,
            program: pending.program,
            outcome,
            score,
            params: pending.params.clone(),
            provenance: pending.provenance,
        };
        debug!(id = %node.id, outcome = ?node.outcome.kind(), score = ?node.score, "node evaluated");
        state.log.push(node.clone());
        (pending.origin, node)
    }

    fn stop_reason(&self, level: &[AttemptNode], state: &RunState) -> Option<Termination> {
        if self.options.stop_when_solved
            && let Some(node) = level
                .iter()
                .find(|node| self.scorer.is_solved(&node.score))
        {
            info!(id = %node.id, "solved, stopping");
            return Some(Termination::Solved { node: node.id });
        }
        if state.budget.is_exhausted() {
            info!("attempt budget exhausted");
            return Some(Termination::AttemptBudgetExhausted);
        }
        None
    }
}

/// Split `attempts` into generator calls of at most `batch` candidates.
fn batches(attempts: usize, batch: usize) -> Vec<usize> {
    let batch = batch.max(1);
    let mut sizes = vec![batch; attempts / batch];
    if attempts % batch > 0 {
        sizes.push(attempts % batch);
    }
    sizes
}

/// Pending application of one edge to one sibling set.
struct EdgeWork<'p> {
    edge: &'p RefinementEdge,
    edge_path: Vec<usize>,
    siblings: Arc<Vec<AttemptNode>>,
    /// Depth of the nodes this work creates.
    depth: u32,
    /// Skip `top_k` truncation (first level under an include-all root).
    select_all: bool,
}

/// One selected group under one edge.
struct FixContext<'p, 'w> {
    work: &'w EdgeWork<'p>,
    group: Group<'w>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Root,
    Fix { context: usize, fix_config: usize },
}

impl Origin {
    fn context(self) -> Option<usize> {
        match self {
            Self::Root => None,
            Self::Fix { context, .. } => Some(context),
        }
    }
}

struct GenerationCall<'p> {
    origin: Origin,
    params: &'p GenerationParams,
    count: usize,
}

struct PendingNode<'p> {
    origin: Origin,
    id: NodeId,
    depth: u32,
    parent_id: Option<NodeId>,
    program: CandidateProgram,
    params: &'p GenerationParams,
    provenance: Provenance,
}

/// Append-only record of evaluated nodes, shared by evaluation tasks.
#[derive(Debug, Default)]
struct NodeLog {
    nodes: Mutex<Vec<AttemptNode>>,
}

impl NodeLog {
    fn push(&self, node: AttemptNode) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node);
    }

    /// Take every recorded node, sorted by id.
    fn drain_sorted(&self) -> Vec<AttemptNode> {
        let mut nodes =
            std::mem::take(&mut *self.nodes.lock().unwrap_or_else(PoisonError::into_inner));
        nodes.sort_by_key(|node| node.id);
        nodes
    }
}

struct RunState {
    log: NodeLog,
    next_id: AtomicU64,
    budget: AttemptBudget,
    generation_slots: Semaphore,
    evaluation_slots: Semaphore,
    levels: AtomicUsize,
    generation_calls: AtomicUsize,
    generation_failures: AtomicUsize,
    candidates_requested: AtomicUsize,
    candidates_generated: AtomicUsize,
}

impl RunState {
    fn new(options: &SearchOptions) -> Self {
        Self {
            log: NodeLog::default(),
            next_id: AtomicU64::new(0),
            budget: AttemptBudget::new(options.budget.max_attempts),
            generation_slots: Semaphore::new(options.max_concurrent_generations),
            evaluation_slots: Semaphore::new(options.max_concurrent_evaluations),
            levels: AtomicUsize::new(0),
            generation_calls: AtomicUsize::new(0),
            generation_failures: AtomicUsize::new(0),
            candidates_requested: AtomicUsize::new(0),
            candidates_generated: AtomicUsize::new(0),
        }
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn stats(&self, nodes: &[AttemptNode]) -> SearchStats {
        let count = |kind: OutcomeKind| {
            nodes
                .iter()
                .filter(|node| node.outcome.kind() == kind)
                .count()
        };
        SearchStats {
            levels: self.levels.load(Ordering::Relaxed),
            generation_calls: self.generation_calls.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
            candidates_requested: self.candidates_requested.load(Ordering::Relaxed),
            candidates_generated: self.candidates_generated.load(Ordering::Relaxed),
            succeeded: count(OutcomeKind::Success),
            runtime_failures: count(OutcomeKind::RuntimeFailure),
            timeouts: count(OutcomeKind::Timeout),
            protocol_failures: count(OutcomeKind::ProtocolFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_split_with_remainder() {
        assert_eq!(batches(5, 2), vec![2, 2, 1]);
        assert_eq!(batches(4, 4), vec![4]);
        assert_eq!(batches(3, 1), vec![1, 1, 1]);
        assert!(batches(0, 3).is_empty());
    }

    #[test]
    fn options_reject_zero_limits() {
        let options = SearchOptions {
            max_concurrent_evaluations: 0,
            generation_batch_size: 0,
            ..SearchOptions::default()
        };
        let errors = options.validate();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(SearchOptions::default().validate().is_empty());
    }

    #[test]
    fn termination_serializes_with_reason_tag() {
        let json = serde_json::to_value(Termination::Solved { node: NodeId(4) }).expect("json");
        assert_eq!(json, serde_json::json!({"reason": "solved", "node": 4}));
    }
}
