#![cfg_attr(test, allow(clippy::unwrap_used))]

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::ParseError, fmt, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

/// Registers the global subscriber with stdout logging.
///
/// `directives` seeds the filter; `RUST_LOG` is honoured by passing the
/// environment's value in from the caller.
pub fn setup_global_subscriber(directives: &str) -> Result<()> {
    let filter = try_filter(directives).context("Failed to parse directives")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .try_init()
        .context("Could not set global default subscriber")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
///
/// A simple directive like `debug` would otherwise drown the log in noise from
/// dependency internals; restate a crate with a lower filter to re-enable it.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    const IRRELEVANT_CRATES: &str = "netlink_proto=warn,smoltcp=warn,russh=info,hickory_proto=info";

    if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
    }
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
