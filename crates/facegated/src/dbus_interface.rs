use crate::attendance::AttendanceQueue;
use crate::service::GalleryService;
use facegate_core::{
    BoundingBox, Embedding, IdentityRecord, LivenessError, LivenessMode, LivenessVerdict, MatchDecisionPolicy,
    RecognitionOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Gallery1";
pub const OBJECT_PATH: &str = "/org/facegate/Gallery1";

#[derive(Serialize)]
struct IdentityEntry<'a> {
    key: &'a str,
    id_real: &'a str,
    full_name: &'a str,
    dim: usize,
}

#[derive(Serialize)]
struct MatchReply<'a> {
    label: &'a str,
    key: Option<&'a str>,
    score: f32,
}

/// D-Bus interface for the facegate gallery daemon.
///
/// Bus name: org.facegate.Gallery1
/// Object path: /org/facegate/Gallery1
pub struct GalleryInterface {
    service: Arc<GalleryService>,
    policy: MatchDecisionPolicy,
    recognition_threshold: f32,
    attendance: Option<Arc<AttendanceQueue>>,
}

/// Embeddings travel as `ad`; the gallery stores `f32`.
fn to_embedding(values: Vec<f64>) -> Embedding {
    Embedding::new(values.into_iter().map(|v| v as f32).collect())
}

/// Liveness verdict computed by the caller; a negative score means the check failed.
fn wire_liveness(is_real: bool, spoof_score: f64) -> Result<LivenessVerdict, LivenessError> {
    if spoof_score < 0.0 {
        Err(LivenessError("liveness check failed upstream".to_string()))
    } else {
        Ok(LivenessVerdict {
            is_real,
            score: spoof_score as f32,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl GalleryInterface {
    pub fn new(
        service: Arc<GalleryService>,
        policy: MatchDecisionPolicy,
        recognition_threshold: f32,
        attendance: Option<Arc<AttendanceQueue>>,
    ) -> Self {
        Self {
            service,
            policy,
            recognition_threshold,
            attendance,
        }
    }

    fn identities_json(&self) -> zbus::fdo::Result<String> {
        let entries = self.service.catalog().gallery().entries();
        let list: Vec<IdentityEntry<'_>> = entries
            .iter()
            .map(|(key, record): &(String, IdentityRecord)| IdentityEntry {
                key,
                id_real: &record.id_real,
                full_name: &record.full_name,
                dim: record.embedding.dim(),
            })
            .collect();
        to_json(&list)
    }

    fn match_json(&self, embedding: Vec<f64>, threshold: f64) -> zbus::fdo::Result<String> {
        let result = self
            .service
            .catalog()
            .query(&to_embedding(embedding), threshold as f32);
        to_json(&MatchReply {
            label: result.label(),
            key: result.key.as_deref(),
            score: result.score,
        })
    }

    fn decide(
        &self,
        embedding: Vec<f64>,
        bbox: (f64, f64, f64, f64),
        is_real: bool,
        spoof_score: f64,
    ) -> RecognitionOutcome {
        let catalog = self.service.catalog();
        let result = catalog.query(&to_embedding(embedding), self.recognition_threshold);
        let bbox = BoundingBox {
            x1: bbox.0 as f32,
            y1: bbox.1 as f32,
            x2: bbox.2 as f32,
            y2: bbox.3 as f32,
            score: 1.0,
        };
        let outcome = self
            .policy
            .decide(bbox, result, || wire_liveness(is_real, spoof_score));

        if let Some(queue) = &self.attendance {
            queue.record_outcome(&outcome, catalog.gallery());
        }
        outcome
    }

    fn status_json(&self) -> zbus::fdo::Result<String> {
        let catalog = self.service.catalog();
        let liveness = match self.policy.mode() {
            LivenessMode::Strict { spoof_threshold } => format!("strict({spoof_threshold})"),
            LivenessMode::Legacy => "legacy".to_string(),
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": catalog.len(),
            "distinct_ids": catalog.gallery().ids().len(),
            "index": catalog.index_kind().to_string(),
            "recognition_threshold": self.recognition_threshold,
            "liveness": liveness,
            "remote_age_secs": self.service.remote_age(),
            "attendance_queued": self.attendance.as_ref().map(|q| q.len()),
            "attendance_dropped": self.attendance.as_ref().map(|q| q.dropped()),
        })
        .to_string())
    }
}

#[interface(name = "org.facegate.Gallery1")]
impl GalleryInterface {
    /// Enroll a precomputed embedding for `id_real`.
    async fn enroll(&self, id_real: &str, full_name: &str, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(id_real, full_name, dim = embedding.len(), "enroll requested");
        let report = self
            .service
            .enroll(id_real, full_name, to_embedding(embedding))
            .await
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        to_json(&report)
    }

    /// Remove every gallery key belonging to `id_real`.
    async fn delete(&self, id_real: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id_real, "delete requested");
        let report = self.service.delete(id_real).await;
        to_json(&report)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        self.identities_json()
    }

    /// Best gallery match for an embedding at the given threshold.
    #[zbus(name = "Match")]
    async fn match_embedding(&self, embedding: Vec<f64>, threshold: f64) -> zbus::fdo::Result<String> {
        self.match_json(embedding, threshold)
    }

    /// Match at the configured threshold and apply the liveness policy.
    ///
    /// `spoof_score < 0` reports a failed liveness check. Accepted outcomes
    /// are queued for attendance delivery.
    async fn recognize(
        &self,
        embedding: Vec<f64>,
        bbox: (f64, f64, f64, f64),
        is_real: bool,
        spoof_score: f64,
    ) -> zbus::fdo::Result<String> {
        let outcome = self.decide(embedding, bbox, is_real, spoof_score);
        to_json(&outcome)
    }

    /// Reload from the remote store (backup on failure); returns the record count.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        let outcome = self.service.reload().await;
        tracing::info!(?outcome, "reload requested");
        match outcome.records() {
            Some(n) => Ok(n as u32),
            None => Err(zbus::fdo::Error::Failed(
                "neither remote store nor backup available".into(),
            )),
        }
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        self.status_json()
    }
}
