//! Grid-transformation puzzle: training examples plus test inputs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::grid::Grid;

/// A demonstration pair the candidate program must reproduce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input: Grid,
    pub output: Grid,
}

/// A held-out input. The answer may be present in evaluation files but is
/// never consulted by the search and never serialized, so it cannot leak
/// into generation requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInput {
    pub input: Grid,
    #[serde(default, skip_serializing)]
    pub output: Option<Grid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub train: Vec<Example>,
    #[serde(default)]
    pub test: Vec<TestInput>,
}

impl Task {
    /// Every grid a candidate runs on: train inputs first, then test inputs.
    pub fn inputs(&self) -> Vec<Grid> {
        self.train
            .iter()
            .map(|example| example.input.clone())
            .chain(self.test.iter().map(|test| test.input.clone()))
            .collect()
    }

    /// Expected outputs for the leading `train.len()` produced grids.
    pub fn expected_outputs(&self) -> Vec<Grid> {
        self.train
            .iter()
            .map(|example| example.output.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.train.is_empty() {
            bail!("task must contain at least one train example");
        }
        Ok(())
    }
}

/// Load a task in the usual `{"train": [...], "test": [...]}` layout.
pub fn load_task(path: &Path) -> Result<Task> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
    let task: Task =
        serde_json::from_str(&contents).with_context(|| format!("parse task {}", path.display()))?;
    task.validate()
        .with_context(|| format!("validate task {}", path.display()))?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "train": [
            {"input": [[1, 0]], "output": [[0, 1]]},
            {"input": [[2, 0]], "output": [[0, 2]]}
        ],
        "test": [{"input": [[3, 0]]}]
    }"#;

    #[test]
    fn inputs_put_train_before_test() {
        let task: Task = serde_json::from_str(SAMPLE).expect("parse");
        let inputs = task.inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[2].rows()[0], vec![3, 0]);
        assert_eq!(task.expected_outputs().len(), 2);
    }

    #[test]
    fn test_answers_are_read_but_not_written() {
        let task: Task = serde_json::from_str(
            r#"{"train": [{"input": [[1]], "output": [[2]]}], "test": [{"input": [[3]], "output": [[7]]}]}"#,
        )
        .expect("parse");
        assert!(task.test[0].output.is_some());
        let json = serde_json::to_value(&task).expect("serialize");
        assert_eq!(json["test"][0], serde_json::json!({"input": [[3]]}));
    }

    #[test]
    fn load_task_rejects_empty_train() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.json");
        fs::write(&path, r#"{"train": [], "test": []}"#).expect("write");
        let err = load_task(&path).unwrap_err();
        assert!(format!("{err:#}").contains("at least one train example"));
    }
}
