//! Logging setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{Error, Result};

/// Filter directive for a connector log level, `None` when unrecognised.
pub fn tracing_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `level` when set.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let directive = tracing_directive(level)
        .ok_or_else(|| Error::Config(format!("invalid log level: {level}")))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let json_layer = json.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_levels_map_to_directives() {
        assert_eq!(tracing_directive("WARNING"), Some("warn"));
        assert_eq!(tracing_directive("critical"), Some("error"));
        assert_eq!(tracing_directive(" Debug "), Some("debug"));
        assert_eq!(tracing_directive("loud"), None);
    }

    #[test]
    fn invalid_level_is_rejected_before_installing() {
        assert!(matches!(init_tracing("loud", false), Err(Error::Config(_))));
    }
}
