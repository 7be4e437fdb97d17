//! Remote gallery store client.
//!
//! Network failures are routine here: every error is reported to the caller
//! as a [`RemoteError`] so the mutation protocol can fall back to local state.

use async_trait::async_trait;
use facegate_core::{identity_key, Embedding, IdentityRecord, Pose};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote store returned status {0}")]
    Status(u16),
    #[error("remote store rejected request: {0}")]
    Rejected(String),
    #[error("remote call timed out")]
    Timeout,
    #[error("remote sync queue is full")]
    QueueFull,
    #[error("remote sync worker is gone")]
    WorkerGone,
}

/// Gallery store shared by all devices.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every identity known to the store, keyed by composite identity key.
    async fn fetch_all(&self) -> Result<Vec<(String, IdentityRecord)>, RemoteError>;

    async fn push(&self, record: &IdentityRecord) -> Result<(), RemoteError>;

    async fn push_augmentation(
        &self,
        id_real: &str,
        pose: Pose,
        embedding: &Embedding,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, id_real: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    success: bool,
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteFace {
    id_real: IdValue,
    full_name: String,
    embedding: Vec<f32>,
}

/// Remote ids are strings, but older rows carry bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Number(i64),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Text(s) => s,
            IdValue::Number(n) => n.to_string(),
        }
    }
}

#[derive(Serialize)]
struct PushBody<'a> {
    id_real: &'a str,
    full_name: &'a str,
    embedding: &'a [f32],
}

#[derive(Serialize)]
struct AugmentationBody<'a> {
    id_real: &'a str,
    pose_type: &'a str,
    embedding: &'a [f32],
}

/// Parse a `GET /api/faces` body into gallery entries.
///
/// Entries that do not parse are skipped one by one; `success: false`
/// fails the whole fetch.
pub fn parse_fetch_body(body: &str) -> Result<Vec<(String, IdentityRecord)>, RemoteError> {
    let response: FetchResponse =
        serde_json::from_str(body).map_err(|e| RemoteError::Rejected(format!("malformed body: {e}")))?;
    if !response.success {
        return Err(RemoteError::Rejected(
            response.message.unwrap_or_else(|| "success=false".to_string()),
        ));
    }

    let mut entries = Vec::with_capacity(response.data.len());
    for (key, value) in response.data {
        match serde_json::from_value::<RemoteFace>(value) {
            Ok(face) => entries.push((
                key,
                IdentityRecord::new(face.id_real.into_string(), face.full_name, Embedding::new(face.embedding)),
            )),
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping malformed remote face"),
        }
    }
    Ok(entries)
}

/// JSON-over-HTTP store (`GET/POST {base}`, `POST {base}/augmentation`,
/// `DELETE {base}/{id_real}`).
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn check(status: StatusCode) -> Result<(), RemoteError> {
        if status == StatusCode::OK || status == StatusCode::CREATED {
            Ok(())
        } else {
            Err(RemoteError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self) -> Result<Vec<(String, IdentityRecord)>, RemoteError> {
        let response = self.client.get(&self.base_url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RemoteError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        let entries = parse_fetch_body(&body)?;
        tracing::info!(entries = entries.len(), "fetched remote gallery");
        Ok(entries)
    }

    async fn push(&self, record: &IdentityRecord) -> Result<(), RemoteError> {
        let body = PushBody {
            id_real: &record.id_real,
            full_name: &record.full_name,
            embedding: record.embedding.as_slice(),
        };
        let response = self.client.post(&self.base_url).json(&body).send().await?;
        Self::check(response.status())?;
        tracing::debug!(
            key = %identity_key(&record.id_real, &record.full_name, None),
            "pushed face to remote store"
        );
        Ok(())
    }

    async fn push_augmentation(
        &self,
        id_real: &str,
        pose: Pose,
        embedding: &Embedding,
    ) -> Result<(), RemoteError> {
        let body = AugmentationBody {
            id_real,
            pose_type: pose.as_str(),
            embedding: embedding.as_slice(),
        };
        let url = format!("{}/augmentation", self.base_url);
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response.status())
    }

    async fn delete(&self, id_real: &str) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.base_url, id_real);
        let response = self.client.delete(&url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RemoteError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_body() {
        let body = r#"{
            "success": true,
            "count": 3,
            "data": {
                "1_Alice": {"id_real": "1", "full_name": "Alice", "embedding": [0.1, 0.2], "created_at": "2025-01-01"},
                "1_Alice_down": {"id_real": 1, "full_name": "Alice (down)", "embedding": [0.2, 0.1]},
                "2_Bob": {"id_real": "2", "full_name": "Bob", "embedding": "not-an-array"}
            }
        }"#;
        let entries = parse_fetch_body(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "1_Alice");
        assert_eq!(entries[0].1.embedding.values, vec![0.1, 0.2]);
        assert_eq!(entries[1].1.id_real, "1");
        assert_eq!(entries[1].1.full_name, "Alice (down)");
    }

    #[test]
    fn test_parse_fetch_body_failure_flag() {
        let err = parse_fetch_body(r#"{"success": false, "message": "db down"}"#).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(ref m) if m == "db down"));
    }

    #[test]
    fn test_parse_fetch_body_malformed() {
        assert!(matches!(
            parse_fetch_body("<html>502</html>"),
            Err(RemoteError::Rejected(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let store = HttpRemoteStore::new("http://localhost:3000/api/faces/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.base_url, "http://localhost:3000/api/faces");
    }

    #[test]
    fn test_push_body_shape() {
        let body = PushBody {
            id_real: "7",
            full_name: "Bob",
            embedding: &[0.5, -0.5],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"id_real": "7", "full_name": "Bob", "embedding": [0.5, -0.5]}));
    }
}
