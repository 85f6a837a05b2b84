//! Grid value type shared by tasks, the sandbox, and scoring.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A rectangular grid of small non-negative cells.
///
/// Equality is exact: two grids are equal only if shape and every cell match.
/// Deserialization goes through [`Grid::new`], so a ragged row list never
/// becomes a `Grid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct Grid {
    rows: Vec<Vec<u8>>,
}

impl Grid {
    /// Build a grid, rejecting rows of differing width.
    pub fn new(rows: Vec<Vec<u8>>) -> Result<Self> {
        if let Some(first) = rows.first() {
            let width = first.len();
            if let Some((index, row)) = rows
                .iter()
                .enumerate()
                .find(|(_, row)| row.len() != width)
            {
                bail!("row {} has {} cells, expected {}", index, row.len(), width);
            }
        }
        Ok(Self { rows })
    }

    /// Convert an arbitrary JSON value into a grid.
    ///
    /// Accepts only a list of lists of integers in `0..=255` with equal row
    /// lengths. Anything else is a malformed grid.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Array(rows) = value else {
            bail!("expected a list of rows, got {}", json_kind(value));
        };
        let rows = rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                let Value::Array(cells) = row else {
                    bail!("row {} is {}, expected a list", r, json_kind(row));
                };
                cells
                    .iter()
                    .enumerate()
                    .map(|(c, cell)| {
                        cell.as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| {
                                anyhow!("cell ({r}, {c}) is {cell}, expected an integer in 0..=255")
                            })
                    })
                    .collect::<Result<Vec<u8>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(rows)
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    pub fn cell_count(&self) -> usize {
        self.height() * self.width()
    }

    /// Number of equal cells when both grids share a shape, `None` otherwise.
    pub fn matching_cells(&self, other: &Grid) -> Option<usize> {
        if self.height() != other.height() || self.width() != other.width() {
            return None;
        }
        let matching = self
            .rows
            .iter()
            .zip(&other.rows)
            .map(|(left, right)| left.iter().zip(right).filter(|(a, b)| a == b).count())
            .sum();
        Some(matching)
    }
}

impl TryFrom<Vec<Vec<u8>>> for Grid {
    type Error = anyhow::Error;

    fn try_from(rows: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(rows)
    }
}

impl From<Grid> for Vec<Vec<u8>> {
    fn from(grid: Grid) -> Self {
        grid.rows
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
