pub mod config;
pub mod errors;
pub mod llm;
pub mod locator;
pub mod perception;

pub use config::AppConfig;
pub use errors::{LocatorError, LocatorResult};
pub use llm::provider::VisionModel;
pub use locator::{CancelFlag, Locator, ParseOutcome, ParseRequest};
pub use perception::types::Detection;

/// Install the global `tracing` subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
