//! Tracing setup for binaries embedding the scan engine.
//!
//! Everything in the crate logs through `tracing` with `scan_id`, `module`
//! and `event_type` fields. Nothing is printed until a subscriber is
//! installed; call [`init_tracing`] once at program start.

use anyhow::{anyhow, Result};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,trawl=debug";

/// `RUST_LOG` if set and valid, otherwise `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// The subscriber [`init_tracing`] installs: `filter` plus a fmt layer with
/// targets and line numbers.
pub fn subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true),
    )
}

/// Install [`subscriber`] globally, filtered by `RUST_LOG` or
/// [`DEFAULT_FILTER`].
///
/// Fails if a global subscriber is already set.
pub fn init_tracing() -> Result<()> {
    subscriber(env_filter(DEFAULT_FILTER))
        .try_init()
        .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))
}
