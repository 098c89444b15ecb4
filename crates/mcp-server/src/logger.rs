//! Logging initialisation via tracing-subscriber.
//!
//! Stdout carries the protocol, so every log line goes to stderr.

use anyhow::{anyhow, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// If `prefer_level` is `true`, `level` wins and `RUST_LOG` is only the
/// fallback when `level` does not parse. Otherwise `RUST_LOG` wins.
pub fn init(level: &str, prefer_level: bool) -> Result<()> {
    let filter = if prefer_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => filter,
            Err(level_err) => EnvFilter::try_from_default_env().map_err(|env_err| {
                anyhow!("invalid log level '{level}': {level_err}; RUST_LOG parse failed: {env_err}")
            })?,
        }
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| anyhow!("invalid log level '{level}': {e}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to set subscriber: {e}"))?;
    Ok(())
}

/// Validate a plain level name before it reaches [`init`].
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    if level.is_empty() {
        anyhow::bail!("log level must not be empty");
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("unrecognised log level: '{level}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_levels_parse() {
        for l in ["error", "warn", "info", "debug", "trace", "off"] {
            assert!(parse_level(l).is_ok(), "expected '{l}' to be valid");
        }
    }

    #[test]
    fn invalid_level_errors() {
        assert!(parse_level("verbose").is_err());
        assert!(parse_level("").is_err());
    }

    #[test]
    fn init_twice_reports_existing_subscriber() {
        let _ = init("warn", true);
        let err = init("warn", true).unwrap_err();
        assert!(err.to_string().contains("set subscriber"), "got {err}");
    }
}
