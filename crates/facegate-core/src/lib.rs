//! facegate-core: identity matching core for edge face recognition.
//!
//! Owns the identity gallery, the nearest-identity search strategies built
//! from it, and the match/liveness decision policy. Detection, alignment,
//! embedding and liveness models plug in through the traits in [`pipeline`].

pub mod catalog;
pub mod gallery;
pub mod geometry;
pub mod index;
pub mod pipeline;
pub mod policy;
pub mod types;

pub use catalog::IdentityCatalog;
pub use gallery::{GalleryError, GallerySink, GallerySource, IdentityGallery, Snapshot};
pub use geometry::Pose;
pub use index::{IndexKind, IndexedSearchIndex, LinearScanIndex, SharedIndex, SimilaritySearchIndex};
pub use pipeline::{FacePipeline, PipelineError};
pub use policy::{LivenessError, LivenessMode, LivenessVerdict, MatchDecisionPolicy};
pub use types::{
    identity_key, BoundingBox, Embedding, FaceRegion, IdentityRecord, MatchResult, RecognitionOutcome,
    UNKNOWN_LABEL,
};
