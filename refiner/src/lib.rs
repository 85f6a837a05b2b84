//! Refinement-tree program search for grid-transformation puzzles.
//!
//! An external generator proposes candidate programs; each candidate runs in
//! an isolated sandbox against the task's inputs and is scored. Survivors are
//! selected (top-k, de-duplicated, optionally pooled) and fed back to the
//! generator as fix contexts, following a declarative [`plan::SearchPlan`].
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (node types, selection, scoring,
//!   invariants, budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (sandbox processes, the generator
//!   backend, config and plan files). Behind traits so tests can use fakes.
//!
//! [`search`] coordinates both to implement the level-by-level scheduler.

pub mod core;
pub mod exit_codes;
pub mod grid;
pub mod io;
pub mod logging;
pub mod plan;
pub mod search;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
