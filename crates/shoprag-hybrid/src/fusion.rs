//! Score fusion of the vector and lexical candidate lists.
use std::collections::HashMap;

use shoprag_core::config::FusionConfig;
use shoprag_core::types::{ChunkId, SearchHit};

/// A chunk's per-source and blended scores, before provenance is attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedHit {
    pub id: ChunkId,
    pub vector_score: f32,
    pub lexical_score: f32,
    pub fused_score: f32,
}

/// Min-max normalizes raw scores into [0, 1]. A single hit, or hits that all
/// share one score, normalize to 1.0.
pub fn min_max_normalize(hits: &[SearchHit]) -> HashMap<ChunkId, f32> {
    let (lo, hi) = hits
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), h| (lo.min(h.score), hi.max(h.score)));
    let span = hi - lo;
    hits.iter()
        .map(|h| {
            let norm = if span > f32::EPSILON { (h.score - lo) / span } else { 1.0 };
            (h.id, norm)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FusionRanker {
    config: FusionConfig,
}

impl FusionRanker {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Blends the two lists into at most `k` hits, fused score descending and
    /// chunk id ascending on ties. A chunk seen by one side only scores 0 on
    /// the other. Vector scores are used as-is, lexical scores are min-max
    /// normalized over the list.
    pub fn fuse(&self, vector: &[SearchHit], lexical: &[SearchHit], k: usize) -> Vec<FusedHit> {
        let lexical_norm = min_max_normalize(lexical);
        let mut merged: HashMap<ChunkId, (f32, f32)> = HashMap::new();
        for hit in vector {
            merged.entry(hit.id).or_default().0 = hit.score.clamp(0.0, 1.0);
        }
        for (id, score) in lexical_norm {
            merged.entry(id).or_default().1 = score;
        }

        let (wv, wl) = (self.config.vector_weight, self.config.lexical_weight);
        let mut fused: Vec<FusedHit> = merged
            .into_iter()
            .map(|(id, (v, l))| FusedHit { id, vector_score: v, lexical_score: l, fused_score: wv * v + wl * l })
            .collect();
        fused.sort_by(|a, b| b.fused_score.total_cmp(&a.fused_score).then(a.id.cmp(&b.id)));
        fused.truncate(k);

        let min_confidence = self.config.min_confidence;
        if min_confidence > 0.0 && fused.first().is_some_and(|best| best.fused_score < min_confidence) {
            tracing::debug!(best = fused[0].fused_score, min_confidence, "below confidence gate");
            return Vec::new();
        }
        fused
    }
}
