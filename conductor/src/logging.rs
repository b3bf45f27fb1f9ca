//! Structured logging init for any binary hosting the orchestrator.
//!
//! Wires `tracing-subscriber` from `RUST_LOG`, defaulting to `info` when
//! unset. Query/stage/step boundaries use `tracing::info_span!`/
//! `#[instrument]`; degrade and drop points (retrieval degraded, cache
//! eviction under pressure, streaming backpressure drops) use `tracing::warn!`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber. Safe to call more than once; only
/// the first call takes effect.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init();
}
