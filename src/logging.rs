//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered by the RUST_LOG environment variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "warn";

/// Initialize the tracing subscriber
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - Show info and above
/// - `RUST_LOG=postbox::store=debug` - Store internals only
/// - `RUST_LOG=postbox=debug,reqwest=info` - Different levels per crate
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init() -> crate::Result<()> {
    init_with(None)
}

/// Initialize with an explicit filter, overriding RUST_LOG
///
/// Used by the CLI `--log` flag.
pub fn init_with(filter: Option<&str>) -> crate::Result<()> {
    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| crate::MailError::Config(format!("Invalid log filter: {}", e)))?,
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| crate::MailError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
