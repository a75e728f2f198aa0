//! Observability: structured logging via `tracing`, plus optional
//! Prometheus counters behind the `prometheus` feature.

pub mod metrics;

#[cfg(feature = "cli")]
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global `tracing` subscriber. Honors `RUST_LOG` if set,
/// otherwise falls back to `info`.
///
/// Only needed by the `factcache-cli` binary; library consumers own their
/// own subscriber setup.
#[cfg(feature = "cli")]
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
