//! Semantic invariants not expressible via JSON Schema.

use std::collections::{HashMap, HashSet};

use crate::core::types::{AttemptNode, NodeId, Provenance};
use crate::plan::{GenerationParams, RefinementEdge, SearchPlan};

/// Check a plan before any generation begins:
/// - at least one root
/// - `pool_size > 0` when set
/// - finite, non-negative temperatures
///
/// Counts are unsigned, so negative attempts or `top_k` cannot be expressed.
pub fn validate_plan(plan: &SearchPlan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.roots.is_empty() {
        errors.push("plan must contain at least one root".to_string());
    }
    for (index, root) in plan.roots.iter().enumerate() {
        let path = format!("roots[{index}]");
        validate_params(&root.params, &format!("{path}.params"), &mut errors);
        for (edge_index, edge) in root.edges.iter().enumerate() {
            validate_edge(edge, &format!("{path}.edges[{edge_index}]"), &mut errors);
        }
    }
    errors
}

fn validate_edge(edge: &RefinementEdge, path: &str, errors: &mut Vec<String>) {
    if edge.selection.pool_size == Some(0) {
        errors.push(format!("{path}.selection: pool_size must be > 0"));
    }
    for (index, fix) in edge.fix_configs.iter().enumerate() {
        validate_params(
            &fix.params,
            &format!("{path}.fix_configs[{index}].params"),
            errors,
        );
    }
    for (index, child) in edge.children.iter().enumerate() {
        validate_edge(child, &format!("{path}.children[{index}]"), errors);
    }
}

fn validate_params(params: &GenerationParams, path: &str, errors: &mut Vec<String>) {
    if !params.temperature.is_finite() || params.temperature < 0.0 {
        errors.push(format!(
            "{path}: temperature must be a finite number >= 0 (got {})",
            params.temperature
        ));
    }
}

/// Check structural integrity of a finished node tree:
/// - no duplicate ids
/// - roots have depth 0 and no parents
/// - every parent exists and `depth == parent.depth + 1`
/// - `parent_id` is the first member of the recorded fix group
pub fn validate_node_tree(nodes: &[AttemptNode]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let by_id: HashMap<NodeId, &AttemptNode> = nodes.iter().map(|node| (node.id, node)).collect();

    for node in nodes {
        if !seen.insert(node.id) {
            errors.push(format!("duplicate id {}", node.id));
        }
        match (&node.provenance, node.parent_id) {
            (Provenance::Root { .. }, None) => {
                if node.depth != 0 {
                    errors.push(format!("{}: root depth {} must be 0", node.id, node.depth));
                }
            }
            (Provenance::Fix { parents, .. }, Some(parent_id)) => {
                if parents.first() != Some(&parent_id) {
                    errors.push(format!(
                        "{}: parent {} is not the group representative",
                        node.id, parent_id
                    ));
                }
                match by_id.get(&parent_id) {
                    Some(parent) if parent.depth + 1 != node.depth => errors.push(format!(
                        "{}: depth {} does not follow parent {} at depth {}",
                        node.id, node.depth, parent.id, parent.depth
                    )),
                    Some(_) => {}
                    None => errors.push(format!("{}: missing parent {}", node.id, parent_id)),
                }
            }
            (Provenance::Root { .. }, Some(parent_id)) => {
                errors.push(format!("{}: root node has parent {}", node.id, parent_id));
            }
            (Provenance::Fix { .. }, None) => {
                errors.push(format!("{}: fix node has no parent", node.id));
            }
        }
    }
    errors
}
