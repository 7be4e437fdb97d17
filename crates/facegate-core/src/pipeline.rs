//! Face pipeline: detect → suppress → crop → align → normalize → embed.
//!
//! Detection, alignment, normalization, embedding and liveness models are
//! external; they plug in through the traits below. Any stage failing for
//! one face drops that face only.

use crate::geometry::{self, Pose, LIVENESS_MARGIN};
use crate::index::SimilaritySearchIndex;
use crate::policy::{LivenessError, LivenessVerdict, MatchDecisionPolicy};
use crate::types::{BoundingBox, Embedding, FaceRegion, Landmarks, RecognitionOutcome};
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

/// Detector confidence floor applied before overlap suppression.
pub const DETECTION_SCORE_THRESHOLD: f32 = 0.5;
/// IoU above which the weaker of two boxes is suppressed.
pub const DETECTION_OVERLAP_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face box lies outside the image")]
    InvalidFaceBox,
    #[error("landmarks not found")]
    NoLandmarks,
    #[error("face alignment failed")]
    AlignmentFailed,
    #[error("{stage} failed: {message}")]
    Collaborator { stage: &'static str, message: String },
}

/// Model-ready face tensor (layout owned by the normalizer/embedder pair).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFace {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<f32>,
}

pub trait FaceDetector: Send {
    /// Candidate face boxes; may overlap.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, PipelineError>;
}

pub trait FaceAligner: Send {
    /// Five-point landmarks inside a face crop.
    fn landmarks(&mut self, face: &DynamicImage) -> Option<Landmarks>;

    /// Warp a face crop to the canonical pose.
    fn align(&mut self, face: &DynamicImage, landmarks: &Landmarks) -> Option<DynamicImage>;
}

pub trait FaceNormalizer: Send {
    fn normalize(&mut self, aligned: &DynamicImage) -> Result<NormalizedFace, PipelineError>;
}

pub trait FaceEmbedder: Send {
    /// Fixed-dimension embedding for a normalized face.
    fn embed(&mut self, face: &NormalizedFace) -> Result<Embedding, PipelineError>;
}

pub trait LivenessChecker: Send {
    /// Classify the (margin-expanded) face region of a full frame.
    fn analyze(&mut self, image: &DynamicImage, region: FaceRegion) -> Result<LivenessVerdict, LivenessError>;
}

/// Embedding of the face chosen for enrollment.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub region: FaceRegion,
    pub embedding: Embedding,
}

pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    aligner: Box<dyn FaceAligner>,
    normalizer: Box<dyn FaceNormalizer>,
    embedder: Box<dyn FaceEmbedder>,
}

impl FacePipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        aligner: Box<dyn FaceAligner>,
        normalizer: Box<dyn FaceNormalizer>,
        embedder: Box<dyn FaceEmbedder>,
    ) -> Self {
        Self {
            detector,
            aligner,
            normalizer,
            embedder,
        }
    }

    /// Detect faces and remove overlapping duplicates, strongest first.
    pub fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, PipelineError> {
        let raw = self.detector.detect(image)?;
        let faces = geometry::suppress_overlaps(&raw, DETECTION_SCORE_THRESHOLD, DETECTION_OVERLAP_THRESHOLD);
        tracing::debug!(raw = raw.len(), kept = faces.len(), "faces detected");
        Ok(faces)
    }

    /// Align, normalize and embed an already-cropped face.
    pub fn embed_crop(&mut self, face: &DynamicImage) -> Result<Embedding, PipelineError> {
        let landmarks = self.aligner.landmarks(face).ok_or(PipelineError::NoLandmarks)?;
        let aligned = self
            .aligner
            .align(face, &landmarks)
            .ok_or(PipelineError::AlignmentFailed)?;
        let normalized = self.normalizer.normalize(&aligned)?;
        self.embedder.embed(&normalized)
    }

    /// Crop `region` out of `image` and embed it.
    pub fn embed_region(&mut self, image: &DynamicImage, region: FaceRegion) -> Result<Embedding, PipelineError> {
        let crop = image.crop_imm(region.x, region.y, region.width, region.height);
        self.embed_crop(&crop)
    }

    /// Embedding of the largest face in an enrollment image.
    pub fn enrollment_embedding(&mut self, image: &DynamicImage) -> Result<FaceEmbedding, PipelineError> {
        let faces = self.detect_faces(image)?;
        let face = geometry::largest_face(&faces).ok_or(PipelineError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), area = face.area(), "multiple faces, using largest");
        }

        let (width, height) = image.dimensions();
        let region = geometry::clamp_to_image(face, width, height).ok_or(PipelineError::InvalidFaceBox)?;
        let embedding = self.embed_region(image, region)?;
        Ok(FaceEmbedding { region, embedding })
    }

    /// Embeddings for vertically shifted crops of `base`, simulating head tilt.
    ///
    /// Variants whose window leaves the image or that fail any stage are
    /// dropped; the result may be empty.
    pub fn pose_variants(&mut self, image: &DynamicImage, base: FaceRegion) -> Vec<(Pose, Embedding)> {
        let (_, height) = image.dimensions();
        let mut variants = Vec::new();

        for pose in Pose::ALL {
            let Some(window) = geometry::shifted_region(&base, pose, height) else {
                tracing::debug!(%pose, "shifted window outside image");
                continue;
            };
            match self.embed_region(image, window) {
                Ok(embedding) => variants.push((pose, embedding)),
                Err(e) => tracing::debug!(%pose, error = %e, "pose variant dropped"),
            }
        }
        variants
    }

    /// Recognize every face in a frame against one published index.
    ///
    /// Faces failing any stage are left out of the result; a detector
    /// failure yields an empty frame.
    pub fn recognize_frame(
        &mut self,
        image: &DynamicImage,
        index: &dyn SimilaritySearchIndex,
        threshold: f32,
        policy: &MatchDecisionPolicy,
        liveness: &mut dyn LivenessChecker,
    ) -> Vec<RecognitionOutcome> {
        let faces = match self.detect_faces(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed for frame");
                return Vec::new();
            }
        };

        let (width, height) = image.dimensions();
        let mut outcomes = Vec::with_capacity(faces.len());

        for face in faces {
            let Some(region) = geometry::clamp_to_image(&face, width, height) else {
                continue;
            };
            let embedding = match self.embed_region(image, region) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, ?region, "face skipped");
                    continue;
                }
            };

            let result = index.query(&embedding, threshold);
            let expanded = geometry::expand_region(&region, LIVENESS_MARGIN, width, height);
            let outcome = policy.decide(face, result, || liveness.analyze(image, expanded));
            outcomes.push(outcome);
        }

        outcomes
    }
}
