//! Console logging for the echo binary.
//!
//! Events are filtered with `RUST_LOG` (default `info`) and printed by a
//! human-readable `fmt` layer with thread ids, source locations and local
//! RFC 3339 timestamps.
//!
//! ```bash
//! RUST_LOG=ferroid_pubsub=debug cargo run --bin ferroid-pubsub-echo
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .init();
}
