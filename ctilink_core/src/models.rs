use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

pub const BUNDLE_TYPE: &str = "bundle";
pub const DEFAULT_SPEC_VERSION: &str = "2.0";

pub const TYPE_REPORT: &str = "report";
pub const TYPE_RELATIONSHIP: &str = "relationship";

/// A STIX object as carried inside a bundle.
///
/// Only the identifier and type tag are interpreted; every other property is
/// kept verbatim so that sub-bundles re-serialize exactly what was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StixObject {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl StixObject {
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn is_report(&self) -> bool {
        self.object_type == TYPE_REPORT
    }

    pub fn is_relationship(&self) -> bool {
        self.object_type == TYPE_RELATIONSHIP
    }

    pub fn created_by_ref(&self) -> Option<&str> {
        self.single_ref("created_by_ref")
    }

    pub fn source_ref(&self) -> Option<&str> {
        self.single_ref("source_ref")
    }

    pub fn target_ref(&self) -> Option<&str> {
        self.single_ref("target_ref")
    }

    pub fn object_marking_refs(&self) -> impl Iterator<Item = &str> {
        self.ref_list("object_marking_refs")
    }

    pub fn object_refs(&self) -> impl Iterator<Item = &str> {
        self.ref_list("object_refs")
    }

    fn single_ref(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    // Non-string entries are ignored rather than rejected.
    fn ref_list(&self, key: &str) -> impl Iterator<Item = &str> {
        self.properties
            .get(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// An immutable envelope of STIX objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub id: String,
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    #[serde(default)]
    pub objects: Vec<StixObject>,
}

fn default_spec_version() -> String {
    DEFAULT_SPEC_VERSION.to_string()
}

impl Bundle {
    /// Wraps `objects` in a new envelope with a freshly generated id.
    pub fn new(objects: Vec<StixObject>) -> Self {
        Self::with_spec_version(objects, DEFAULT_SPEC_VERSION)
    }

    pub fn with_spec_version(objects: Vec<StixObject>, spec_version: impl Into<String>) -> Self {
        Self {
            bundle_type: BUNDLE_TYPE.to_string(),
            id: format!("bundle--{}", uuid::Uuid::new_v4()),
            spec_version: spec_version.into(),
            objects,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let bundle: Bundle = serde_json::from_str(raw)
            .map_err(|e| Error::decode(format!("bundle is not valid JSON: {e}")))?;
        if bundle.bundle_type != BUNDLE_TYPE {
            return Err(Error::decode(format!(
                "expected an envelope of type \"{BUNDLE_TYPE}\", got \"{}\"",
                bundle.bundle_type
            )));
        }
        Ok(bundle)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    ExternalImport,
    InternalImportFile,
    InternalEnrichment,
    InternalExportFile,
    Stream,
}

impl ConnectorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExternalImport => "EXTERNAL_IMPORT",
            Self::InternalImportFile => "INTERNAL_IMPORT_FILE",
            Self::InternalEnrichment => "INTERNAL_ENRICHMENT",
            Self::InternalExportFile => "INTERNAL_EXPORT_FILE",
            Self::Stream => "STREAM",
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXTERNAL_IMPORT" => Ok(Self::ExternalImport),
            "INTERNAL_IMPORT_FILE" => Ok(Self::InternalImportFile),
            "INTERNAL_ENRICHMENT" => Ok(Self::InternalEnrichment),
            "INTERNAL_EXPORT_FILE" => Ok(Self::InternalExportFile),
            "STREAM" => Ok(Self::Stream),
            other => Err(Error::Config(format!("unknown connector type: {other}"))),
        }
    }
}

/// What the connector tells the control plane about itself at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub scope: Vec<String>,
    pub auto: bool,
    pub only_contextual: bool,
}

/// Broker coordinates handed out by the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub use_ssl: bool,
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub connection: BrokerSettings,
    /// Queue this connector consumes from.
    pub listen: String,
    /// Exchange bundles are pushed to.
    pub push_exchange: String,
}

/// Platform user the connector acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorUser {
    pub id: String,
}

/// Result of registering with the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    #[serde(default)]
    pub connector_user: Option<ConnectorUser>,
    /// Raw JSON of the persisted connector state, if any.
    pub connector_state: Option<String>,
    pub config: QueueConfig,
}

impl Registration {
    pub fn connector_user_id(&self) -> Option<&str> {
        self.connector_user.as_ref().map(|u| u.id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub connector_state: Option<String>,
}

/// A file handed to the control plane for manual validation instead of import.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFile {
    pub file_name: String,
    pub data: String,
    pub mime_type: String,
    pub entity_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stix_object_keeps_unknown_properties() {
        let raw = json!({
            "type": "indicator",
            "id": "indicator--1",
            "pattern": "[ipv4-addr:value = '1.2.3.4']",
            "created_by_ref": "identity--1",
            "object_marking_refs": ["marking-definition--1", 7, "marking-definition--2"]
        });
        let obj: StixObject = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(obj.object_type, "indicator");
        assert_eq!(obj.created_by_ref(), Some("identity--1"));
        assert_eq!(
            obj.object_marking_refs().collect::<Vec<_>>(),
            vec!["marking-definition--1", "marking-definition--2"]
        );
        assert_eq!(serde_json::to_value(&obj).unwrap(), raw);
    }

    #[test]
    fn bundle_rejects_foreign_envelopes() {
        let err = Bundle::from_json(r#"{"type":"report","id":"x","objects":[]}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let err = Bundle::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn bundle_defaults_spec_version_and_generates_ids() {
        let bundle = Bundle::from_json(r#"{"type":"bundle","id":"bundle--1"}"#).unwrap();
        assert_eq!(bundle.spec_version, DEFAULT_SPEC_VERSION);
        assert!(bundle.is_empty());

        let a = Bundle::new(vec![]);
        let b = Bundle::new(vec![]);
        assert!(a.id.starts_with("bundle--"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn broker_settings_hide_the_password() {
        let settings: BrokerSettings = serde_json::from_value(json!({
            "host": "rabbit", "port": 5672, "user": "guest", "pass": "secret"
        }))
        .unwrap();
        assert!(!settings.use_ssl);
        let debug = format!("{settings:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("rabbit"));
    }

    #[test]
    fn connector_type_parses_case_insensitively() {
        assert_eq!(
            "stream".parse::<ConnectorType>().unwrap(),
            ConnectorType::Stream
        );
        assert_eq!(
            serde_json::to_value(ConnectorType::InternalEnrichment).unwrap(),
            json!("INTERNAL_ENRICHMENT")
        );
        assert!("BATCH".parse::<ConnectorType>().is_err());
    }
}
