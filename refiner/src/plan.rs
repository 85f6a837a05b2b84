//! Declarative search plan: the configuration tree the scheduler walks.
//!
//! A plan is plain nested data. Each level is a flat record, children are
//! owned, and there are no back references, so a plan round-trips through
//! JSON (or any serde format) unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters forwarded verbatim to the generator.
///
/// `options` is an opaque pass-through map (prompt feature flags and the like);
/// the scheduler never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 1.0,
            options: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    pub fn new(model: impl Into<String>, temperature: f64) -> Self {
        Self {
            model: model.into(),
            temperature,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// How a sibling set is turned into fix contexts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSpec {
    pub top_k: usize,
    #[serde(default)]
    pub dedupe_by_code: bool,
    #[serde(default)]
    pub dedupe_by_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl SelectionSpec {
    pub fn top(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    pub fn dedupe_code(mut self) -> Self {
        self.dedupe_by_code = true;
        self
    }

    pub fn dedupe_output(mut self) -> Self {
        self.dedupe_by_output = true;
        self
    }

    pub fn pooled(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }
}

/// How many fix candidates to request for one selected or pooled context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixGenerationSpec {
    pub attempts: usize,
    #[serde(default)]
    pub params: GenerationParams,
}

/// One refinement round and the rounds nested below it.
///
/// `children` apply to the fix candidates this edge produces for a single
/// group. An edge without children is a leaf of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementEdge {
    pub selection: SelectionSpec,
    #[serde(default)]
    pub fix_configs: Vec<FixGenerationSpec>,
    #[serde(default)]
    pub children: Vec<RefinementEdge>,
}

impl RefinementEdge {
    pub fn new(selection: SelectionSpec) -> Self {
        Self {
            selection,
            fix_configs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn fix(mut self, attempts: usize, params: GenerationParams) -> Self {
        self.fix_configs
            .push(FixGenerationSpec { attempts, params });
        self
    }

    pub fn child(mut self, edge: RefinementEdge) -> Self {
        self.children.push(edge);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Fix candidates requested for each group this edge selects.
    pub fn attempts_per_group(&self) -> usize {
        self.fix_configs.iter().map(|fix| fix.attempts).sum()
    }
}

/// A root population and the refinement edges applied to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootSpec {
    pub attempts: usize,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub edges: Vec<RefinementEdge>,
    /// Forward every root attempt produced so far into the first-level edges,
    /// bypassing their `top_k` truncation.
    #[serde(default)]
    pub include_all_attempts_in_fixes: bool,
}

impl RootSpec {
    pub fn new(attempts: usize, params: GenerationParams) -> Self {
        Self {
            attempts,
            params,
            edges: Vec::new(),
            include_all_attempts_in_fixes: false,
        }
    }

    pub fn edge(mut self, edge: RefinementEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn include_all_attempts(mut self) -> Self {
        self.include_all_attempts_in_fixes = true;
        self
    }
}

/// Root populations run in order within one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPlan {
    pub roots: Vec<RootSpec>,
}

impl SearchPlan {
    pub fn single(root: RootSpec) -> Self {
        Self { roots: vec![root] }
    }

    pub fn then(mut self, root: RootSpec) -> Self {
        self.roots.push(root);
        self
    }
}

/// Plan written by `refiner init`: a root-only warmup population followed by
/// a larger population refined through a top-k chain and a pooled chain.
pub fn example_plan() -> SearchPlan {
    let params = GenerationParams::new("o3-mini", 0.95)
        .with_option("use_ascii", true)
        .with_option("use_array", true)
        .with_option("include_diffs", true);
    let fix_params = params.clone().with_option("use_fix_fail_line", true);

    SearchPlan::single(RootSpec::new(4, params.clone())).then(
        RootSpec::new(16, params)
            .include_all_attempts()
            .edge(
                RefinementEdge::new(SelectionSpec::top(4))
                    .fix(4, fix_params.clone())
                    .child(RefinementEdge::new(SelectionSpec::top(2)).fix(4, fix_params.clone())),
            )
            .edge(
                RefinementEdge::new(SelectionSpec::top(6).dedupe_output().pooled(3))
                    .fix(3, fix_params.clone())
                    .child(
                        RefinementEdge::new(SelectionSpec::top(3).pooled(3)).fix(3, fix_params),
                    ),
            ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_plan_round_trips_through_json() {
        let plan = example_plan();
        let json = serde_json::to_string_pretty(&plan).expect("serialize");
        let parsed: SearchPlan = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, plan);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let edge: RefinementEdge =
            serde_json::from_str(r#"{"selection": {"top_k": 2}}"#).expect("parse");
        assert!(edge.is_leaf());
        assert_eq!(edge.attempts_per_group(), 0);
        assert_eq!(edge.selection.pool_size, None);
        assert!(!edge.selection.dedupe_by_code);
    }

    #[test]
    fn attempts_per_group_sums_fix_configs() {
        let edge = RefinementEdge::new(SelectionSpec::top(1))
            .fix(3, GenerationParams::default())
            .fix(2, GenerationParams::default());
        assert_eq!(edge.attempts_per_group(), 5);
    }
}
