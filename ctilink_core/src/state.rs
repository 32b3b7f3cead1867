use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::Result;

/// State key holding the live stream cursor.
pub const LAST_EVENT_ID_KEY: &str = "connectorLastEventId";

/// Cursor value meaning "nothing consumed yet".
pub const CURSOR_START: &str = "-";

/// Connector-owned state, kept as the raw JSON document the control plane
/// round-trips.
///
/// Writers are the stream consumer (checkpoints), heartbeat reconciliation and
/// explicit callers. The lock only guards memory safety: callers mixing those
/// writers must still order their read-modify-write cycles themselves.
#[derive(Debug, Clone, Default)]
pub struct ConnectorStateStore {
    raw: Arc<Mutex<Option<String>>>,
}

impl ConnectorStateStore {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            raw: Arc::new(Mutex::new(initial)),
        }
    }

    /// Current state, or `None` when absent, empty, unparsable or not an object.
    pub async fn get(&self) -> Option<Map<String, Value>> {
        parse_state(self.raw.lock().await.as_deref())
    }

    pub async fn set(&self, state: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        *self.raw.lock().await = Some(raw);
        Ok(())
    }

    pub async fn raw(&self) -> Option<String> {
        self.raw.lock().await.clone()
    }

    pub async fn replace_raw(&self, raw: Option<String>) {
        *self.raw.lock().await = raw;
    }

    pub async fn last_event_id(&self) -> Option<String> {
        self.get()
            .await
            .and_then(|s| s.get(LAST_EVENT_ID_KEY).and_then(Value::as_str).map(str::to_string))
    }

    /// Records `event_id` as the stream cursor, keeping the other keys.
    pub async fn checkpoint(&self, event_id: &str) -> Result<()> {
        let mut guard = self.raw.lock().await;
        let mut state = parse_state(guard.as_deref()).unwrap_or_default();
        state.insert(
            LAST_EVENT_ID_KEY.to_string(),
            Value::String(event_id.to_string()),
        );
        *guard = Some(serde_json::to_string(&state)?);
        Ok(())
    }
}

pub(crate) fn parse_state(raw: Option<&str>) -> Option<Map<String, Value>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_ignores_unusable_documents() {
        for raw in [None, Some(""), Some("  "), Some("[1,2]"), Some("{}"), Some("{oops")] {
            let store = ConnectorStateStore::new(raw.map(str::to_string));
            assert!(store.get().await.is_none(), "{raw:?} should read as no state");
        }
    }

    #[tokio::test]
    async fn checkpoint_preserves_other_keys() {
        let store = ConnectorStateStore::new(Some(r#"{"last_run":42}"#.to_string()));
        store.checkpoint("10-0").await.unwrap();
        let state = store.get().await.unwrap();
        assert_eq!(state["last_run"], 42);
        assert_eq!(store.last_event_id().await.as_deref(), Some("10-0"));

        store.checkpoint("11-0").await.unwrap();
        assert_eq!(store.last_event_id().await.as_deref(), Some("11-0"));
    }

    #[tokio::test]
    async fn clones_share_the_same_document() {
        let store = ConnectorStateStore::default();
        let other = store.clone();
        other.checkpoint("5-0").await.unwrap();
        assert_eq!(store.last_event_id().await.as_deref(), Some("5-0"));
    }
}
