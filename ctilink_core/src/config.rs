//! Connector configuration.
//!
//! Every value is resolved from the environment first (`<SECTION>_<KEY>`,
//! e.g. `CONNECTOR_LIVE_STREAM_ID`), then from an optional YAML document at
//! `<section>.<key>`, then from its default.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::models::{ConnectorDescriptor, ConnectorType};
use crate::o11y::tracing_directive;
use crate::{Error, Result};

/// Where the platform API lives and how to talk to it.
#[derive(Clone, Serialize)]
pub struct PlatformConfig {
    pub url: String,
    pub token: String,
    pub ssl_verify: bool,
    pub json_logging: bool,
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("ssl_verify", &self.ssl_verify)
            .field("json_logging", &self.json_logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSettings {
    pub id: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub name: String,
    pub scope: Vec<String>,
    pub confidence_level: Option<u8>,
    pub auto: bool,
    pub only_contextual: bool,
    pub log_level: String,
    /// One-shot connectors: no heartbeat.
    pub run_and_terminate: bool,
    /// Submitted bundles become pending files awaiting manual validation.
    pub validate_before_import: bool,
    pub live_stream_id: Option<String>,
    pub live_stream_listen_delete: bool,
    pub live_stream_no_dependencies: bool,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorConfig {
    pub opencti: PlatformConfig,
    pub connector: ConnectorSettings,
}

impl ConnectorConfig {
    /// A config with every optional value at its default.
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        connector_id: impl Into<String>,
        connector_name: impl Into<String>,
        connector_type: ConnectorType,
    ) -> Self {
        Self {
            opencti: PlatformConfig {
                url: url.into(),
                token: token.into(),
                ssl_verify: true,
                json_logging: false,
            },
            connector: ConnectorSettings {
                id: connector_id.into(),
                connector_type,
                name: connector_name.into(),
                scope: Vec::new(),
                confidence_level: None,
                auto: false,
                only_contextual: false,
                log_level: "info".to_string(),
                run_and_terminate: false,
                validate_before_import: false,
                live_stream_id: None,
                live_stream_listen_delete: true,
                live_stream_no_dependencies: false,
                heartbeat_interval_secs: 40,
            },
        }
    }

    /// Loads from the process environment and, when given, a YAML file.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self> {
        let mut source = ConfigSource::from_process_env();
        if let Some(path) = yaml_path {
            source = source.with_yaml_file(path)?;
        }
        Self::from_source(&source)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let connector_type = source
            .string("connector", "type")
            .ok_or_else(|| Error::Config("CONNECTOR_TYPE is required".into()))?
            .parse::<ConnectorType>()?;

        let mut cfg = Self::new(
            source.string("opencti", "url").unwrap_or_default(),
            source.string("opencti", "token").unwrap_or_default(),
            source.string("connector", "id").unwrap_or_default(),
            source.string("connector", "name").unwrap_or_default(),
            connector_type,
        );

        let platform = &mut cfg.opencti;
        platform.ssl_verify = source.bool("opencti", "ssl_verify", platform.ssl_verify)?;
        platform.json_logging = source.bool("opencti", "json_logging", platform.json_logging)?;

        let c = &mut cfg.connector;
        if let Some(scope) = source.string("connector", "scope") {
            c.scope = scope
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        c.confidence_level = source
            .string("connector", "confidence_level")
            .map(|v| {
                v.parse::<u8>()
                    .ok()
                    .filter(|n| *n <= 100)
                    .ok_or_else(|| Error::Config(format!("invalid CONNECTOR_CONFIDENCE_LEVEL: {v}")))
            })
            .transpose()?;
        c.auto = source.bool("connector", "auto", c.auto)?;
        c.only_contextual = source.bool("connector", "only_contextual", c.only_contextual)?;
        if let Some(level) = source.string("connector", "log_level") {
            c.log_level = level.to_ascii_lowercase();
        }
        c.run_and_terminate = source.bool("connector", "run_and_terminate", c.run_and_terminate)?;
        c.validate_before_import =
            source.bool("connector", "validate_before_import", c.validate_before_import)?;
        c.live_stream_id = source.string("connector", "live_stream_id");
        c.live_stream_listen_delete =
            source.bool("connector", "live_stream_listen_delete", c.live_stream_listen_delete)?;
        c.live_stream_no_dependencies = source.bool(
            "connector",
            "live_stream_no_dependencies",
            c.live_stream_no_dependencies,
        )?;
        if let Some(v) = source.string("connector", "heartbeat_interval_secs") {
            c.heartbeat_interval_secs = v.parse().map_err(|_| {
                Error::Config(format!("invalid CONNECTOR_HEARTBEAT_INTERVAL_SECS: {v}"))
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn validate(&self) -> Result<()> {
        if self.opencti.url.trim().is_empty() {
            return Err(Error::Config("OPENCTI_URL is required".into()));
        }
        if self.opencti.token.trim().is_empty() {
            return Err(Error::Config("OPENCTI_TOKEN is required".into()));
        }
        if self.connector.id.trim().is_empty() {
            return Err(Error::Config("CONNECTOR_ID is required".into()));
        }
        if self.connector.name.trim().is_empty() {
            return Err(Error::Config("CONNECTOR_NAME is required".into()));
        }
        if self.connector.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "CONNECTOR_HEARTBEAT_INTERVAL_SECS must be > 0".into(),
            ));
        }
        if tracing_directive(&self.connector.log_level).is_none() {
            return Err(Error::Config(format!(
                "invalid CONNECTOR_LOG_LEVEL: {}",
                self.connector.log_level
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.connector.heartbeat_interval_secs)
    }

    pub fn descriptor(&self) -> ConnectorDescriptor {
        ConnectorDescriptor {
            id: self.connector.id.clone(),
            name: self.connector.name.clone(),
            connector_type: self.connector.connector_type,
            scope: self.connector.scope.clone(),
            auto: self.connector.auto,
            only_contextual: self.connector.only_contextual,
        }
    }

    /// JSON view safe to print or log.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(token) = value.pointer_mut("/opencti/token") {
            *token = serde_json::Value::String("<redacted>".into());
        }
        value
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Layered lookup: environment, then YAML.
pub struct ConfigSource {
    env: EnvLookup,
    yaml: Option<serde_yaml::Value>,
}

impl ConfigSource {
    pub fn from_process_env() -> Self {
        Self::with_env(|name| std::env::var(name).ok())
    }

    pub fn with_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            env: Box::new(lookup),
            yaml: None,
        }
    }

    pub fn with_yaml(mut self, yaml: serde_yaml::Value) -> Self {
        self.yaml = Some(yaml);
        self
    }

    pub fn with_yaml_str(self, raw: &str) -> Result<Self> {
        let yaml = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid YAML config: {e}")))?;
        Ok(self.with_yaml(yaml))
    }

    pub fn with_yaml_file(self, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        self.with_yaml_str(&raw)
    }

    /// Raw value for `section.key`; blank values count as unset.
    pub fn string(&self, section: &str, key: &str) -> Option<String> {
        let env_name = format!("{section}_{key}").to_ascii_uppercase();
        if let Some(v) = (self.env)(&env_name) {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
        let node = self.yaml.as_ref()?.get(section)?.get(key)?;
        let v = match node {
            serde_yaml::Value::String(s) => s.trim().to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .filter_map(|i| match i {
                    serde_yaml::Value::String(s) => Some(s.clone()),
                    serde_yaml::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(","),
            _ => return None,
        };
        (!v.is_empty()).then_some(v)
    }

    pub fn bool(&self, section: &str, key: &str, default: bool) -> Result<bool> {
        match self.string(section, key) {
            None => Ok(default),
            Some(v) => parse_bool(&v).ok_or_else(|| {
                Error::Config(format!(
                    "invalid boolean for {}: {v}",
                    format!("{section}_{key}").to_ascii_uppercase()
                ))
            }),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> ConfigSource {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigSource::with_env(move |name| env.get(name).cloned())
    }

    const REQUIRED: [(&str, &str); 5] = [
        ("OPENCTI_URL", "http://localhost:8080"),
        ("OPENCTI_TOKEN", "secret-token"),
        ("CONNECTOR_ID", "2f0c9d3e-1111-4222-8333-444455556666"),
        ("CONNECTOR_TYPE", "external_import"),
        ("CONNECTOR_NAME", "Feed"),
    ];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let cfg = ConnectorConfig::from_source(&source(&REQUIRED)).unwrap();
        assert_eq!(cfg.connector.connector_type, ConnectorType::ExternalImport);
        assert!(cfg.opencti.ssl_verify);
        assert!(!cfg.opencti.json_logging);
        assert!(cfg.connector.live_stream_listen_delete);
        assert!(!cfg.connector.live_stream_no_dependencies);
        assert!(!cfg.connector.run_and_terminate);
        assert_eq!(cfg.connector.log_level, "info");
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(40));
        assert!(cfg.connector.scope.is_empty());
    }

    #[test]
    fn environment_wins_over_yaml() {
        let yaml = r#"
opencti:
  url: http://from-yaml:8080
  ssl_verify: false
connector:
  scope: [ipv4-addr, domain-name]
  confidence_level: 75
  live_stream_id: live-1
  run_and_terminate: yes
"#;
        let mut env = REQUIRED.to_vec();
        env.push(("CONNECTOR_LIVE_STREAM_ID", "live-env"));
        let src = source(&env).with_yaml_str(yaml).unwrap();
        let cfg = ConnectorConfig::from_source(&src).unwrap();

        assert_eq!(cfg.opencti.url, "http://localhost:8080");
        assert!(!cfg.opencti.ssl_verify);
        assert_eq!(cfg.connector.scope, vec!["ipv4-addr", "domain-name"]);
        assert_eq!(cfg.connector.confidence_level, Some(75));
        assert_eq!(cfg.connector.live_stream_id.as_deref(), Some("live-env"));
        assert!(cfg.connector.run_and_terminate);
    }

    #[test]
    fn missing_or_invalid_values_are_rejected() {
        let no_token: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "OPENCTI_TOKEN")
            .collect();
        let err = ConnectorConfig::from_source(&source(&no_token)).unwrap_err();
        assert!(err.to_string().contains("OPENCTI_TOKEN"));

        let mut bad_bool = REQUIRED.to_vec();
        bad_bool.push(("CONNECTOR_AUTO", "maybe"));
        assert!(ConnectorConfig::from_source(&source(&bad_bool)).is_err());

        let mut zero = REQUIRED.to_vec();
        zero.push(("CONNECTOR_HEARTBEAT_INTERVAL_SECS", "0"));
        assert!(ConnectorConfig::from_source(&source(&zero)).is_err());

        let mut level = REQUIRED.to_vec();
        level.push(("CONNECTOR_LOG_LEVEL", "chatty"));
        assert!(ConnectorConfig::from_source(&source(&level)).is_err());

        let mut kind = REQUIRED.to_vec();
        kind.retain(|(k, _)| *k != "CONNECTOR_TYPE");
        kind.push(("CONNECTOR_TYPE", "NOPE"));
        assert!(ConnectorConfig::from_source(&source(&kind)).is_err());
    }

    #[test]
    fn token_never_leaks_through_debug_or_redacted() {
        let cfg = ConnectorConfig::from_source(&source(&REQUIRED)).unwrap();
        assert!(!format!("{cfg:?}").contains("secret-token"));
        let redacted = cfg.redacted();
        assert_eq!(redacted["opencti"]["token"], "<redacted>");
        assert_eq!(redacted["connector"]["type"], "EXTERNAL_IMPORT");
    }
}
