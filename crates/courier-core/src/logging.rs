//! tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Selects JSON output when set to `json`.
pub const LOG_FORMAT_ENV: &str = "COURIER_LOG_FORMAT";

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Output is human-readable unless `COURIER_LOG_FORMAT=json`. Calling it more
/// than once is harmless: later calls leave the first subscriber in place.
///
/// ```no_run
/// courier_core::setup_logging();
/// tracing::info!("consumer starting");
/// ```
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
