//! Search plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::invariants::validate_plan;
use crate::io::config::write_atomic;
use crate::plan::SearchPlan;

/// Default plan file name, relative to the working directory.
pub const PLAN_FILE: &str = "plan.json";

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/plan/v1.schema.json"
));

/// Load and validate a plan from disk (schema + invariants).
pub fn load_plan(path: &Path) -> Result<SearchPlan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Parse and validate plan JSON.
pub fn parse_plan(contents: &str) -> Result<SearchPlan> {
    let value: Value = serde_json::from_str(contents).context("parse plan json")?;
    validate_schema(&value)?;
    let plan: SearchPlan = serde_json::from_value(value).context("deserialize plan")?;
    ensure_plan_invariants(&plan)?;
    Ok(plan)
}

/// Write a plan as pretty JSON (temp file + rename).
pub fn write_plan(path: &Path, plan: &SearchPlan) -> Result<()> {
    ensure_plan_invariants(plan)?;
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Reject a plan that violates semantic invariants, listing every violation.
pub fn ensure_plan_invariants(plan: &SearchPlan) -> Result<()> {
    let errors = validate_plan(plan);
    if errors.is_empty() {
        return Ok(());
    }
    bail!("invalid search plan:\n- {}", errors.join("\n- "))
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(plan)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("invalid search plan:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
