//! Logging init, matching the base crate's `tracing`/`tracing-subscriber`/
//! `tracing-appender` wiring in its binary entrypoints, generalized to a
//! single shared initializer instead of one copy per bin.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(log_level: &str) {
    let filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
