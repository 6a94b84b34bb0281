//! Diagnostic tracing for ralph.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of ralph product output.
//!
//! - **Progress log and iteration artifacts (`io/progress_log`, `io/iteration_log`)**:
//!   product output in `progress.txt` and `.ralph/iterations/`. Always written,
//!   unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when it is unset or
/// invalid. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=ralph=debug ralph run --tool claude
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, embedders) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Default filter for a command.
pub fn default_directive(verbose: bool, loop_command: bool) -> &'static str {
    match (verbose, loop_command) {
        (true, _) => "debug",
        (false, true) => "info",
        (false, false) => "warn",
    }
}
