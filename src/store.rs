//! Laptop-side persisted tunnel state.
//!
//! A single JSON document written atomically (temp file + rename) after each
//! tunnel or session lifecycle event, so a restart reconnects with the same
//! tunnel id. The format is stable; unknown fields are preserved on read.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};

use crate::util;

/// The persisted tunnel registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredTunnel {
    #[serde(rename = "tunnelId")]
    pub tunnel_id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
    #[serde(rename = "wsUrl")]
    pub ws_url: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "laptopName")]
    pub laptop_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole document: tunnel registration plus opaque session records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<StoredTunnel>,
    /// Session records are owned by the embedding process; kept opaque so
    /// their shape never constrains this crate.
    #[serde(default)]
    pub sessions: Vec<Value>,
    /// Milliseconds since the Unix epoch; stamped on every save.
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Read/write handle for the state document.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing file yields the default (empty) state.
    pub async fn load(&self) -> io::Result<PersistedState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persist the document atomically: write a temp file next to the
    /// target, then rename over it. Stamps `lastUpdated`.
    pub async fn save(&self, state: &mut PersistedState) -> io::Result<()> {
        state.last_updated = Some(util::now_ms());
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> StateStore {
        let path = std::env::temp_dir().join(format!(
            "backhaul-state-test-{}.json",
            uuid::Uuid::new_v4()
        ));
        StateStore::new(path)
    }

    fn sample_tunnel() -> StoredTunnel {
        StoredTunnel {
            tunnel_id: "t1".into(),
            api_key: "k1".into(),
            public_url: "https://relay.example.com/api/t1".into(),
            ws_url: "wss://relay.example.com/tunnel/t1".into(),
            created_at: 1_722_500_000_000,
            laptop_name: "dev-laptop".into(),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_default() {
        let store = temp_store();
        let state = store.load().await.unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = temp_store();
        let mut state = PersistedState {
            tunnel: Some(sample_tunnel()),
            sessions: vec![json!({"sessionId": "s1", "name": "build"})],
            last_updated: None,
            extra: Map::new(),
        };
        store.save(&mut state).await.unwrap();
        assert!(state.last_updated.is_some());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        let _ = tokio::fs::remove_file(store.path()).await;
    }

    #[tokio::test]
    async fn test_unknown_fields_are_preserved() {
        let store = temp_store();
        let document = json!({
            "tunnel": {
                "tunnelId": "t1",
                "apiKey": "k1",
                "publicUrl": "u",
                "wsUrl": "w",
                "createdAt": 1,
                "laptopName": "n",
                "fingerprint": "ab:cd",
            },
            "sessions": [],
            "lastUpdated": 2,
            "schemaVersion": 3,
        });
        tokio::fs::write(store.path(), document.to_string())
            .await
            .unwrap();

        let mut state = store.load().await.unwrap();
        assert_eq!(state.extra["schemaVersion"], 3);
        assert_eq!(
            state.tunnel.as_ref().unwrap().extra["fingerprint"],
            "ab:cd"
        );

        store.save(&mut state).await.unwrap();
        let raw: Value = serde_json::from_slice(&tokio::fs::read(store.path()).await.unwrap())
            .unwrap();
        assert_eq!(raw["schemaVersion"], 3);
        assert_eq!(raw["tunnel"]["fingerprint"], "ab:cd");
        let _ = tokio::fs::remove_file(store.path()).await;
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_document() {
        let store = temp_store();
        let mut state = PersistedState {
            tunnel: Some(sample_tunnel()),
            ..PersistedState::default()
        };
        store.save(&mut state).await.unwrap();

        state.tunnel.as_mut().unwrap().api_key = "rotated".into();
        store.save(&mut state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.tunnel.unwrap().api_key, "rotated");
        let _ = tokio::fs::remove_file(store.path()).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let store = temp_store();
        tokio::fs::write(store.path(), b"{not json").await.unwrap();
        assert!(store.load().await.is_err());
        let _ = tokio::fs::remove_file(store.path()).await;
    }
}
