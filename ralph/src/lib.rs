//! Iteration loop orchestrator for external coding agents.
//!
//! Ralph repeatedly picks the highest-priority eligible task from a task
//! store, hands it to an agent CLI and records the outcome. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, budget accounting,
//!   attempt classification, state updates). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (task store, config, process
//!   execution, logs). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`step`], [`looping`], [`select`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod select;
pub mod step;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
