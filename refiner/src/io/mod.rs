//! Side-effecting operations: child processes, the sandbox, the generator
//! backend, and configuration files.
//!
//! Everything that touches the filesystem or spawns a process lives here so
//! the scheduler can be driven by in-memory fakes in tests.

pub mod config;
pub mod generator;
pub mod plan_store;
pub mod process;
pub mod sandbox;
