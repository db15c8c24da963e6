//! Subscriber setup for binaries and tests embedding the client.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn filter(level: &str) -> EnvFilter {
    // RUST_LOG wins over the configured level
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already set.
pub fn try_init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_target(true))
        .try_init()?;
    Ok(())
}

/// Install the global subscriber, keeping an existing one.
pub fn init(level: &str) {
    if let Err(e) = try_init(level) {
        tracing::debug!(target: "client", error = %e, "Subscriber already installed");
    }
}
