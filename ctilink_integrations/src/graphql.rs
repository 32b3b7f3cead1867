//! Platform GraphQL API client: connector registration, pings, work reports
//! and pending-file uploads.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ctilink_core::models::{
    ConnectorDescriptor, PendingFile, PingResponse, Registration,
};
use ctilink_core::traits::{ControlPlane, WorkTracker};
use ctilink_core::{Error, PlatformConfig, Result};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::instrument;

const APPLICANT_HEADER: &str = "opencti-applicant-id";

const REGISTER_CONNECTOR: &str = r#"
mutation RegisterConnector($input: RegisterConnectorInput) {
  registerConnector(input: $input) {
    id
    connector_state
    config {
      connection { host use_ssl port user pass }
      listen
      push_exchange
    }
    connector_user { id }
  }
}"#;

const DELETE_CONNECTOR: &str = r#"
mutation ConnectorDeletionMutation($id: ID!) {
  deleteConnector(id: $id)
}"#;

const PING_CONNECTOR: &str = r#"
mutation PingConnector($id: ID!, $state: String) {
  pingConnector(id: $id, state: $state) {
    id
    connector_state
  }
}"#;

const WORK_TO_RECEIVED: &str = r#"
mutation workToReceived($id: ID!, $message: String) {
  workEdit(id: $id) { toReceived(message: $message) }
}"#;

const WORK_TO_PROCESSED: &str = r#"
mutation workToProcessed($id: ID!, $message: String, $inError: Boolean) {
  workEdit(id: $id) { toProcessed(message: $message, inError: $inError) }
}"#;

const WORK_ADD_EXPECTATIONS: &str = r#"
mutation addExpectations($id: ID!, $expectations: Int) {
  workEdit(id: $id) { addExpectations(expectations: $expectations) }
}"#;

const WORK_PING: &str = r#"
mutation pingWork($id: ID!) {
  workEdit(id: $id) { ping }
}"#;

const UPLOAD_PENDING: &str = r#"
mutation UploadPending($file: Upload!, $entityId: String) {
  uploadPending(file: $file, entityId: $entityId) { id }
}"#;

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Pulls `data.<field>` out of a GraphQL response, turning reported errors
/// into `Error::ControlPlane`.
fn extract<T: DeserializeOwned>(body: Value, field: &str) -> Result<T> {
    let resp: GraphqlResponse = serde_json::from_value(body)
        .map_err(|e| Error::ControlPlane(format!("malformed graphql response: {e}")))?;
    if !resp.errors.is_empty() {
        let messages = resp
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::ControlPlane(messages));
    }
    let value = resp
        .data
        .and_then(|mut d| d.get_mut(field).map(Value::take))
        .unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| Error::ControlPlane(format!("unexpected `{field}` payload: {e}")))
}

fn register_variables(connector: &ConnectorDescriptor) -> Value {
    json!({
        "input": {
            "id": connector.id,
            "name": connector.name,
            "type": connector.connector_type.as_str(),
            "scope": connector.scope,
            "auto": connector.auto,
            "only_contextual": connector.only_contextual,
        }
    })
}

fn ping_variables(
    connector_id: &str,
    state: Option<&Map<String, Value>>,
) -> Result<Value> {
    let state = state.map(serde_json::to_string).transpose()?;
    Ok(json!({ "id": connector_id, "state": state }))
}

/// Client for the platform API acting as control plane and work tracker.
pub struct OpenCtiClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    applicant_id: Mutex<Option<String>>,
}

impl std::fmt::Debug for OpenCtiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCtiClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl OpenCtiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, ssl_verify: bool) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!ssl_verify)
            .build()
            .map_err(|e| Error::transport("build http client", e))?;
        Ok(Self {
            base_url,
            token: token.into(),
            http,
            applicant_id: Mutex::new(None),
        })
    }

    pub fn from_config(cfg: &PlatformConfig) -> Result<Self> {
        Self::new(&cfg.url, &cfg.token, cfg.ssl_verify)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self) -> String {
        format!("{}/graphql", self.base_url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        fn value(v: &str) -> Result<HeaderValue> {
            HeaderValue::from_str(v).map_err(|e| Error::InvalidInput(format!("header value: {e}")))
        }

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value(&format!("Bearer {}", self.token))?);
        let applicant = self
            .applicant_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(applicant) = applicant {
            headers.insert(HeaderName::from_static(APPLICANT_HEADER), value(&applicant)?);
        }
        Ok(headers)
    }

    async fn read(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::ControlPlane(format!("platform returned {status}: {text}")));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| Error::transport("read graphql response", e))
    }

    async fn query<T: DeserializeOwned>(&self, query: &str, variables: Value, field: &str) -> Result<T> {
        let resp = self
            .http
            .post(self.url())
            .headers(self.headers()?)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| Error::transport("graphql request", e))?;
        extract(Self::read(resp).await?, field)
    }
}

#[async_trait]
impl ControlPlane for OpenCtiClient {
    #[instrument(level = "info", skip_all, fields(connector_id = %connector.id))]
    async fn register(&self, connector: &ConnectorDescriptor) -> Result<Registration> {
        self.query(REGISTER_CONNECTOR, register_variables(connector), "registerConnector")
            .await
    }

    #[instrument(level = "info", skip(self))]
    async fn unregister(&self, connector_id: &str) -> Result<()> {
        let _: Value = self
            .query(DELETE_CONNECTOR, json!({ "id": connector_id }), "deleteConnector")
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, state))]
    async fn ping(
        &self,
        connector_id: &str,
        state: Option<&Map<String, Value>>,
    ) -> Result<PingResponse> {
        self.query(PING_CONNECTOR, ping_variables(connector_id, state)?, "pingConnector")
            .await
    }

    fn set_applicant_id(&self, applicant_id: Option<&str>) {
        *self
            .applicant_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = applicant_id.map(str::to_string);
    }

    #[instrument(level = "info", skip_all, fields(file_name = %file.file_name))]
    async fn upload_pending_file(&self, file: &PendingFile) -> Result<()> {
        let operations = json!({
            "query": UPLOAD_PENDING,
            "variables": { "file": null, "entityId": file.entity_id },
        });
        let part = Part::text(file.data.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| Error::InvalidInput(format!("mime type {}: {e}", file.mime_type)))?;
        let form = Form::new()
            .text("operations", operations.to_string())
            .text("map", json!({ "0": ["variables.file"] }).to_string())
            .part("0", part);

        let resp = self
            .http
            .post(self.url())
            .headers(self.headers()?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::transport("upload pending file", e))?;
        let _: Value = extract(Self::read(resp).await?, "uploadPending")?;
        Ok(())
    }
}

#[async_trait]
impl WorkTracker for OpenCtiClient {
    #[instrument(level = "debug", skip(self, message))]
    async fn to_received(&self, work_id: &str, message: &str) -> Result<()> {
        let _: Value = self
            .query(WORK_TO_RECEIVED, json!({ "id": work_id, "message": message }), "workEdit")
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, message))]
    async fn to_processed(&self, work_id: &str, message: &str, in_error: bool) -> Result<()> {
        let vars = json!({ "id": work_id, "message": message, "inError": in_error });
        let _: Value = self.query(WORK_TO_PROCESSED, vars, "workEdit").await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn add_expectations(&self, work_id: &str, expectations: usize) -> Result<()> {
        let vars = json!({ "id": work_id, "expectations": expectations });
        let _: Value = self.query(WORK_ADD_EXPECTATIONS, vars, "workEdit").await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn ping(&self, work_id: &str) -> Result<()> {
        let _: Value = self.query(WORK_PING, json!({ "id": work_id }), "workEdit").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctilink_core::models::ConnectorType;

    #[test]
    fn registration_is_read_from_data() {
        let body = json!({
            "data": {
                "registerConnector": {
                    "id": "c-1",
                    "connector_state": "{\"last_run\":1}",
                    "config": {
                        "connection": {
                            "host": "rabbit", "use_ssl": false, "port": 5672,
                            "user": "u", "pass": "p"
                        },
                        "listen": "listen_c-1",
                        "push_exchange": "amqp.worker.exchange"
                    },
                    "connector_user": { "id": "user--1" }
                }
            }
        });
        let reg: Registration = extract(body, "registerConnector").unwrap();
        assert_eq!(reg.id, "c-1");
        assert_eq!(reg.config.listen, "listen_c-1");
        assert_eq!(reg.config.connection.host, "rabbit");
        assert_eq!(reg.connector_user_id(), Some("user--1"));
        assert_eq!(reg.connector_state.as_deref(), Some("{\"last_run\":1}"));

        let body = json!({
            "data": {
                "registerConnector": {
                    "id": "c-2",
                    "connector_state": null,
                    "config": {
                        "connection": { "host": "rabbit", "port": 5672, "user": "u", "pass": "p" },
                        "listen": "listen_c-2",
                        "push_exchange": "amqp.worker.exchange"
                    },
                    "connector_user": null
                }
            }
        });
        let reg: Registration = extract(body, "registerConnector").unwrap();
        assert_eq!(reg.connector_user_id(), None);
        assert!(!reg.config.connection.use_ssl);
    }

    #[test]
    fn reported_errors_become_control_plane_errors() {
        let body = json!({
            "data": null,
            "errors": [{ "message": "forbidden" }, { "message": "try later" }]
        });
        let err = extract::<PingResponse>(body, "pingConnector").unwrap_err();
        match err {
            Error::ControlPlane(msg) => assert_eq!(msg, "forbidden; try later"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ping_sends_state_as_a_json_string() {
        let mut state = Map::new();
        state.insert("cursor".into(), json!("10-0"));
        let vars = ping_variables("c-1", Some(&state)).unwrap();
        assert_eq!(vars["state"], "{\"cursor\":\"10-0\"}");
        let vars = ping_variables("c-1", None).unwrap();
        assert!(vars["state"].is_null());

        let resp: PingResponse =
            extract(json!({ "data": { "pingConnector": { "id": "c-1", "connector_state": null } } }), "pingConnector")
                .unwrap();
        assert_eq!(resp.connector_state, None);
    }

    #[test]
    fn register_input_carries_the_descriptor() {
        let vars = register_variables(&ConnectorDescriptor {
            id: "c-1".into(),
            name: "Feed".into(),
            connector_type: ConnectorType::ExternalImport,
            scope: vec!["report".into()],
            auto: false,
            only_contextual: true,
        });
        assert_eq!(vars["input"]["type"], "EXTERNAL_IMPORT");
        assert_eq!(vars["input"]["scope"][0], "report");
        assert_eq!(vars["input"]["only_contextual"], true);
    }

    #[test]
    fn applicant_header_follows_the_current_applicant() {
        let client = OpenCtiClient::new("http://platform:8080/", "secret", true).unwrap();
        assert_eq!(client.base_url(), "http://platform:8080");
        assert!(client.headers().unwrap().get(APPLICANT_HEADER).is_none());

        client.set_applicant_id(Some("user--2"));
        let headers = client.headers().unwrap();
        assert_eq!(headers[APPLICANT_HEADER], "user--2");
        assert_eq!(headers[AUTHORIZATION], "Bearer secret");

        client.set_applicant_id(None);
        assert!(client.headers().unwrap().get(APPLICANT_HEADER).is_none());
        assert!(!format!("{client:?}").contains("secret"));
    }
}
