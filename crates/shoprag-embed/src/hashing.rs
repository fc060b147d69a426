use std::hash::Hasher;

use shoprag_core::traits::Embedder;
use twox_hash::XxHash64;

/// Deterministic feature-hashing embedder.
///
/// Each lower-cased alphanumeric word and each adjacent word pair is hashed
/// into one of `dim` buckets with a hash-derived sign; the result is
/// L2-normalized. Texts sharing vocabulary land close together, which is
/// enough for offline use and for tests. Text with no words maps to the zero
/// vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

const BIGRAM_WEIGHT: f32 = 0.5;

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(feature.as_bytes());
        let h = hasher.finish();
        let idx = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        (idx, sign)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let mut v = vec![0f32; self.dim];
        for word in &words {
            let (idx, sign) = self.bucket(word);
            v[idx] += sign;
        }
        for pair in words.windows(2) {
            let (idx, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            v[idx] += sign * BIGRAM_WEIGHT;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
