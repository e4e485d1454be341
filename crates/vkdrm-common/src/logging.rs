use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read for the log filter.
pub const LOG_ENV: &str = "VKDRM_LOG";

/// Initialize structured logging with environment filter.
/// Set VKDRM_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}
