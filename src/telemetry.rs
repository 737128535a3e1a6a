//! Opt-in tracing bootstrap.
//!
//! The library only *emits* `tracing` events; installing a subscriber is the
//! host's call. [`init`] is a convenience for binaries, demos, and tests
//! that want sensible output without assembling layers themselves. It is
//! never invoked by the library itself.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG` (defaulting to
/// `error,baton=info`). Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("error,baton=info"))
        .unwrap_or_else(|_| EnvFilter::new("error"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_span_events(FmtSpan::NONE);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
