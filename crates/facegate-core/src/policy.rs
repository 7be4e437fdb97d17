//! Match/liveness decision policy.
//!
//! Combines a [`MatchResult`] with the external liveness verdict into the
//! label every downstream consumer acts on. Liveness is evaluated only for
//! recognized identities; an unknown face skips the check entirely.

use crate::types::{BoundingBox, MatchResult, RecognitionOutcome, FAKE_PREFIX, UNKNOWN_LABEL};
use std::str::FromStr;
use thiserror::Error;

/// Reserved spoof score meaning "the liveness check could not run".
pub const LIVENESS_ERROR_SCORE: f32 = -1.0;

/// Default spoof-score threshold for [`LivenessMode::Strict`].
pub const DEFAULT_SPOOF_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("liveness check failed: {0}")]
pub struct LivenessError(pub String);

/// Raw output of the liveness classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessVerdict {
    pub is_real: bool,
    pub score: f32,
}

/// How a liveness verdict is turned into accept/reject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessMode {
    /// `is_real && score > spoof_threshold`.
    Strict { spoof_threshold: f32 },
    /// `is_real` alone. Kept for deployments tuned against the older rule.
    Legacy,
}

impl Default for LivenessMode {
    fn default() -> Self {
        LivenessMode::Strict {
            spoof_threshold: DEFAULT_SPOOF_THRESHOLD,
        }
    }
}

impl LivenessMode {
    pub fn accepts(&self, verdict: &LivenessVerdict) -> bool {
        match self {
            LivenessMode::Strict { spoof_threshold } => {
                verdict.is_real && verdict.score > *spoof_threshold
            }
            LivenessMode::Legacy => verdict.is_real,
        }
    }

    /// Parse `"strict"` / `"legacy"`; strict uses `spoof_threshold`.
    pub fn parse(s: &str, spoof_threshold: f32) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(LivenessMode::Strict { spoof_threshold }),
            "legacy" => Ok(LivenessMode::Legacy),
            other => Err(format!("unknown liveness mode: {other}")),
        }
    }
}

impl FromStr for LivenessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, DEFAULT_SPOOF_THRESHOLD)
    }
}

/// Stateless per-face decision policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MatchDecisionPolicy {
    mode: LivenessMode,
}

impl MatchDecisionPolicy {
    pub fn new(mode: LivenessMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> LivenessMode {
        self.mode
    }

    /// Produce the final outcome for one face.
    ///
    /// `liveness` is invoked only when `result` names an identity. An error
    /// from it becomes `is_real = false, spoof_score = -1.0`. A failed
    /// liveness check relabels the face as `"FAKE: {key}"` but leaves the
    /// similarity confidence untouched.
    pub fn decide<F>(&self, bbox: BoundingBox, result: MatchResult, liveness: F) -> RecognitionOutcome
    where
        F: FnOnce() -> Result<LivenessVerdict, LivenessError>,
    {
        let Some(key) = result.key else {
            return RecognitionOutcome {
                bbox,
                label: UNKNOWN_LABEL.to_string(),
                identity_key: None,
                confidence: result.score,
                is_real: true,
                spoof_score: 0.0,
            };
        };

        let (is_real, spoof_score) = match liveness() {
            Ok(verdict) => (self.mode.accepts(&verdict), verdict.score),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "liveness check errored; treating face as fake");
                (false, LIVENESS_ERROR_SCORE)
            }
        };

        let label = if is_real {
            key.clone()
        } else {
            tracing::info!(key = %key, spoof_score, "liveness rejected recognized face");
            format!("{FAKE_PREFIX}{key}")
        };

        RecognitionOutcome {
            bbox,
            label,
            identity_key: Some(key),
            confidence: result.score,
            is_real,
            spoof_score,
        }
    }
}
