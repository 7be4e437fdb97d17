//! Nearest-identity search over a gallery snapshot.
//!
//! Two strategies answer the same 1-NN query:
//!
//! - [`LinearScanIndex`] computes cosine similarity against every stored
//!   embedding in snapshot order.
//! - [`IndexedSearchIndex`] L2-normalizes everything once at build time into
//!   a contiguous row-major matrix and maximizes the inner product, which
//!   equals cosine similarity for unit vectors.
//!
//! Both keep the first-seen candidate on ties and reject scores that do not
//! strictly exceed the threshold. An index is immutable once built; a
//! gallery change produces a new index that is published through
//! [`SharedIndex`].

use crate::gallery::Snapshot;
use crate::types::{cosine_similarity, Embedding, MatchResult};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Score reported when the index holds no comparable candidate.
pub const NO_CANDIDATE_SCORE: f32 = -1.0;

/// Strategy for comparing a query embedding against a gallery snapshot.
pub trait SimilaritySearchIndex: Send + Sync {
    /// Best `(key, score)` for `target`; `key` is `None` unless `score > threshold`.
    fn query(&self, target: &Embedding, threshold: f32) -> MatchResult;

    /// Number of indexed embeddings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> IndexKind;
}

/// Which search strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    #[default]
    Linear,
    Indexed,
}

impl IndexKind {
    /// Build a fresh index of this kind from a gallery snapshot.
    pub fn build(self, snapshot: Snapshot) -> Arc<dyn SimilaritySearchIndex> {
        match self {
            IndexKind::Linear => Arc::new(LinearScanIndex::build(snapshot)),
            IndexKind::Indexed => Arc::new(IndexedSearchIndex::build(snapshot)),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Linear => f.write_str("linear"),
            IndexKind::Indexed => f.write_str("indexed"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(IndexKind::Linear),
            "indexed" | "flat-ip" => Ok(IndexKind::Indexed),
            other => Err(format!("unknown index kind: {other}")),
        }
    }
}

/// Apply the strict-greater threshold rule to a running best.
fn decide(best: Option<(&str, f32)>, threshold: f32) -> MatchResult {
    match best {
        Some((key, score)) if score > threshold => MatchResult::matched(key, score),
        Some((_, score)) => MatchResult::unknown(score),
        None => MatchResult::unknown(NO_CANDIDATE_SCORE),
    }
}

/// Exact cosine scan in stable snapshot order. O(N·D) per query.
pub struct LinearScanIndex {
    entries: Snapshot,
    dim: Option<usize>,
}

impl LinearScanIndex {
    pub fn build(snapshot: Snapshot) -> Self {
        let dim = snapshot.first().map(|(_, e)| e.dim());
        Self {
            entries: snapshot,
            dim,
        }
    }
}

impl SimilaritySearchIndex for LinearScanIndex {
    fn query(&self, target: &Embedding, threshold: f32) -> MatchResult {
        if let Some(dim) = self.dim {
            if target.dim() != dim {
                tracing::warn!(expected = dim, got = target.dim(), "query dimension mismatch");
                return MatchResult::unknown(NO_CANDIDATE_SCORE);
            }
        }

        let mut best: Option<(&str, f32)> = None;
        for (key, embedding) in &self.entries {
            let score = cosine_similarity(target.as_slice(), embedding.as_slice());
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((key.as_str(), score));
            }
        }

        decide(best, threshold)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Linear
    }
}

/// Flat inner-product index over L2-normalized rows.
pub struct IndexedSearchIndex {
    keys: Vec<String>,
    /// Row-major `keys.len() × dim` matrix of unit vectors.
    matrix: Vec<f32>,
    dim: usize,
}

impl IndexedSearchIndex {
    pub fn build(snapshot: Snapshot) -> Self {
        let dim = snapshot.first().map(|(_, e)| e.dim()).unwrap_or(0);
        let mut keys = Vec::with_capacity(snapshot.len());
        let mut matrix = Vec::with_capacity(snapshot.len() * dim);

        for (key, embedding) in snapshot {
            keys.push(key);
            matrix.extend_from_slice(embedding.normalized().as_slice());
        }

        tracing::debug!(rows = keys.len(), dim, "built inner-product index");
        Self { keys, matrix, dim }
    }
}

impl SimilaritySearchIndex for IndexedSearchIndex {
    fn query(&self, target: &Embedding, threshold: f32) -> MatchResult {
        if self.keys.is_empty() {
            return MatchResult::unknown(NO_CANDIDATE_SCORE);
        }
        if target.dim() != self.dim {
            tracing::warn!(expected = self.dim, got = target.dim(), "query dimension mismatch");
            return MatchResult::unknown(NO_CANDIDATE_SCORE);
        }

        let q = target.normalized();
        let mut best: Option<(&str, f32)> = None;
        for (key, row) in self.keys.iter().zip(self.matrix.chunks_exact(self.dim)) {
            let score: f32 = row.iter().zip(q.as_slice()).map(|(a, b)| a * b).sum();
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((key.as_str(), score));
            }
        }

        decide(best, threshold)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Indexed
    }
}

/// Atomically published search index.
///
/// Builds happen off to the side; `publish` only swaps an `Arc`, so readers
/// see either the previous complete index or the new one.
pub struct SharedIndex {
    kind: IndexKind,
    current: RwLock<Arc<dyn SimilaritySearchIndex>>,
}

impl SharedIndex {
    /// Start with an empty index of the given kind.
    pub fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            current: RwLock::new(kind.build(Vec::new())),
        }
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Handle to the currently published index.
    pub fn current(&self) -> Arc<dyn SimilaritySearchIndex> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Build from `snapshot` and publish, discarding the previous index.
    pub fn rebuild(&self, snapshot: Snapshot) {
        let index = self.kind.build(snapshot);
        self.publish(index);
    }

    pub fn publish(&self, index: Arc<dyn SimilaritySearchIndex>) {
        *self.current.write().unwrap() = index;
    }

    pub fn query(&self, target: &Embedding, threshold: f32) -> MatchResult {
        self.current().query(target, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn snapshot(items: &[(&str, &[f32])]) -> Snapshot {
        items.iter().map(|(k, v)| (k.to_string(), emb(v))).collect()
    }

    fn both(snap: Snapshot) -> [Arc<dyn SimilaritySearchIndex>; 2] {
        [
            IndexKind::Linear.build(snap.clone()),
            IndexKind::Indexed.build(snap),
        ]
    }

    fn random_embedding(rng: &mut StdRng, dim: usize) -> Embedding {
        Embedding::new((0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
    }

    #[test]
    fn test_best_match_is_last_entry() {
        let snap = snapshot(&[
            ("1_decoy", &[0.0, 1.0, 0.0]),
            ("2_decoy", &[0.0, 0.0, 1.0]),
            ("3_match", &[1.0, 0.0, 0.0]),
        ]);
        for idx in both(snap) {
            let r = idx.query(&emb(&[1.0, 0.0, 0.0]), 0.5);
            assert_eq!(r.key.as_deref(), Some("3_match"), "{}", idx.kind());
            assert!((r.score - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_single_identity_scenario() {
        let e1 = [0.2f32, 0.9, -0.3, 0.1];
        for idx in both(snapshot(&[("1_Alice", &e1)])) {
            let hit = idx.query(&emb(&e1), 0.65);
            assert_eq!(hit.key.as_deref(), Some("1_Alice"));
            assert!((hit.score - 1.0).abs() < 1e-5);

            let miss = idx.query(&emb(&[0.9, -0.2, 0.1, 0.4]), 0.65);
            assert_eq!(miss.label(), "Unknown");
            assert!(miss.score < 0.65);
        }
    }

    #[test]
    fn test_rejection_reports_raw_score() {
        for idx in both(snapshot(&[("1_A", &[1.0, 1.0])])) {
            let r = idx.query(&emb(&[1.0, 0.0]), 0.9);
            assert!(!r.is_match());
            assert!((r.score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        // Axis-aligned vectors give exact scores: 1.0 and 0.0.
        for idx in both(snapshot(&[("1_A", &[1.0, 0.0])])) {
            assert!(!idx.query(&emb(&[1.0, 0.0]), 1.0).is_match());
            assert!(idx.query(&emb(&[1.0, 0.0]), 0.999).is_match());
            assert!(!idx.query(&emb(&[0.0, 1.0]), 0.0).is_match());
        }
    }

    #[test]
    fn test_ties_keep_first_seen() {
        let snap = snapshot(&[("1_first", &[1.0, 0.0]), ("2_second", &[2.0, 0.0])]);
        for idx in both(snap) {
            let r = idx.query(&emb(&[1.0, 0.0]), 0.5);
            assert_eq!(r.key.as_deref(), Some("1_first"), "{}", idx.kind());
        }
    }

    #[test]
    fn test_empty_index_returns_unknown() {
        for idx in both(Vec::new()) {
            assert!(idx.is_empty());
            for target in [emb(&[1.0, 0.0]), emb(&[0.0, 0.0]), emb(&[0.3; 128])] {
                let r = idx.query(&target, 0.65);
                assert_eq!(r.label(), "Unknown");
                assert_eq!(r.score, NO_CANDIDATE_SCORE);
            }
        }
    }

    #[test]
    fn test_zero_vectors_do_not_crash() {
        let snap = snapshot(&[("1_zero", &[0.0, 0.0, 0.0]), ("2_x", &[1.0, 0.0, 0.0])]);
        for idx in both(snap) {
            let r = idx.query(&emb(&[0.0, 0.0, 0.0]), 0.5);
            assert!(r.score.is_finite());
            assert!(!r.is_match());

            let r = idx.query(&emb(&[1.0, 0.0, 0.0]), 0.5);
            assert_eq!(r.key.as_deref(), Some("2_x"));
        }
    }

    #[test]
    fn test_query_dimension_mismatch_is_unknown() {
        for idx in both(snapshot(&[("1_A", &[1.0, 0.0])])) {
            let r = idx.query(&emb(&[1.0, 0.0, 0.0]), 0.1);
            assert!(!r.is_match());
            assert_eq!(r.score, NO_CANDIDATE_SCORE);
        }
    }

    #[test]
    fn test_linear_and_indexed_agree_on_random_galleries() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for &n in &[0usize, 1, 2, 17, 250] {
            for &dim in &[3usize, 128, 192] {
                let snap: Snapshot = (0..n)
                    .map(|i| (format!("{i}_person"), random_embedding(&mut rng, dim)))
                    .collect();
                let linear = LinearScanIndex::build(snap.clone());
                let indexed = IndexedSearchIndex::build(snap.clone());

                for q in 0..20 {
                    // Mix of fresh vectors and perturbed gallery members.
                    let target = if n > 0 && q % 2 == 0 {
                        let base = &snap[rng.gen_range(0..n)].1;
                        Embedding::new(
                            base.values.iter().map(|v| v + rng.gen_range(-0.05f32..0.05)).collect(),
                        )
                    } else {
                        random_embedding(&mut rng, dim)
                    };

                    let a = linear.query(&target, 0.65);
                    let b = indexed.query(&target, 0.65);
                    assert!((a.score - b.score).abs() < 1e-5, "n={n} dim={dim}: {} vs {}", a.score, b.score);
                    if (a.score - 0.65).abs() > 1e-5 {
                        assert_eq!(a.is_match(), b.is_match(), "n={n} dim={dim}");
                    }

                    let a = linear.query(&target, -1.0);
                    let b = indexed.query(&target, -1.0);
                    if n > 0 {
                        let ka = a.key.as_ref().unwrap();
                        let kb = b.key.as_ref().unwrap();
                        if ka != kb {
                            // Only acceptable for candidates tied within tolerance.
                            let ea = &snap.iter().find(|(k, _)| k == ka).unwrap().1;
                            let eb = &snap.iter().find(|(k, _)| k == kb).unwrap().1;
                            assert!((target.similarity(ea) - target.similarity(eb)).abs() < 1e-5);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let snap = snapshot(&[("1_A", &[1.0, 0.2]), ("2_B", &[0.1, 1.0]), ("3_C", &[-1.0, 0.4])]);
        let targets = [emb(&[0.9, 0.3]), emb(&[0.0, 1.0]), emb(&[-0.5, 0.5])];
        for kind in [IndexKind::Linear, IndexKind::Indexed] {
            let first = kind.build(snap.clone());
            let second = kind.build(snap.clone());
            for p in &targets {
                assert_eq!(first.query(p, 0.3), second.query(p, 0.3));
            }
        }
    }

    #[test]
    fn test_shared_index_publish_swaps() {
        let shared = SharedIndex::new(IndexKind::Indexed);
        let before = shared.current();
        assert!(shared.query(&emb(&[1.0, 0.0]), 0.5).key.is_none());

        shared.rebuild(snapshot(&[("1_A", &[1.0, 0.0])]));
        assert_eq!(shared.query(&emb(&[1.0, 0.0]), 0.5).key.as_deref(), Some("1_A"));

        // A handle taken before the swap keeps answering from the old index.
        assert!(before.is_empty());
        assert_eq!(shared.current().len(), 1);
        assert_eq!(shared.current().kind(), IndexKind::Indexed);
    }

    #[test]
    fn test_index_kind_parse() {
        assert_eq!("linear".parse::<IndexKind>().unwrap(), IndexKind::Linear);
        assert_eq!("INDEXED".parse::<IndexKind>().unwrap(), IndexKind::Indexed);
        assert!("hnsw".parse::<IndexKind>().is_err());
        assert_eq!(IndexKind::Indexed.to_string(), "indexed");
    }
}
