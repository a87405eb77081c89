//! Diagnostics go to stderr so they never mix with command output.

use anyhow::{Result, anyhow};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter from `RUST_LOG` when set and valid, else `default_level`, else `warn`.
pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().compact().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| anyhow!("cannot install the logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_levels_fall_back() {
        // Only meaningful without RUST_LOG overriding the default.
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter("debug").to_string(), "debug");
            assert_eq!(filter("shell_engine=loud").to_string(), "warn");
        }
    }
}
