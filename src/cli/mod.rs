//! CLI command implementations.

pub mod analyze;
pub mod batch;
pub mod doctor;
pub mod serve;

use tracing_subscriber::EnvFilter;

/// Initialize tracing. `RUST_LOG` wins; otherwise `--verbose` selects
/// debug-level output for this crate.
pub fn init_tracing(verbose: bool) {
    let default = if verbose {
        "labelscan=debug,info"
    } else {
        "labelscan=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
