// src/logging.rs

use color_eyre::eyre::Result;
use once_cell::sync::Lazy;
use tracing_error::ErrorLayer;
use tracing_subscriber::{self, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub static PROJECT_NAME: Lazy<String> =
    Lazy::new(|| env!("CARGO_CRATE_NAME").to_uppercase().to_string());
pub static LOG_ENV: Lazy<String> = Lazy::new(|| format!("{}_LOGLEVEL", *PROJECT_NAME));

/// Initializes stdout logging using the tracing subscriber. A service writes
/// to stdout and leaves files to the process supervisor.
pub fn initialize_logging() -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV.clone()))
        .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")));

    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .with(ErrorLayer::default())
        .init();

    Ok(())
}
