//! Shared tracing/logging initialization.
//!
//! The node daemon and the authority server both set up `tracing_subscriber`
//! with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default `RUST_LOG`-style directive for a binary.
///
/// `crate_target` is the crate's log target (e.g. `"karaoke_node"`); the
/// shared core crate always logs at the same level so storage and config
/// messages are not lost.
pub fn default_filter(crate_target: &str, level: &str) -> String {
    format!("{crate_target}={level},karaoke_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"karaoke_node=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// A second call is a no-op; the first subscriber stays installed.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let result = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
