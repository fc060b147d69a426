use shoprag_core::config::{EmbeddingConfig, EmbeddingProviderKind};
use shoprag_core::traits::Embedder;
use shoprag_embed::{get_default_embedder, HashingEmbedder};

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[test]
fn hashing_embedder_shapes_and_determinism() {
    let embedder = get_default_embedder(&EmbeddingConfig::default()).expect("embedder");
    assert_eq!(embedder.dim(), 384);

    let texts = vec!["spindle warmup procedure".to_string(), "spindle warmup procedure".to_string()];
    let embs = embedder.embed_batch(&texts).expect("embed_batch");
    assert_eq!(embs.len(), 2);
    assert_eq!(embs[0].len(), 384);

    let norm: f32 = embs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");
    assert_eq!(embs[0], embs[1]);
}

#[test]
fn shared_vocabulary_is_closer() {
    let e = HashingEmbedder::new(256);
    let query = e.embed_one("How do I warm up the spindle?");
    let related = e.embed_one("Spindle warm up: run at 500 rpm for ten minutes.");
    let unrelated = e.embed_one("Coolant concentration should be between six and eight percent.");
    assert!(cosine(&query, &related) > cosine(&query, &unrelated));
}

#[test]
fn case_and_punctuation_do_not_matter() {
    let e = HashingEmbedder::new(64);
    assert_eq!(e.embed_one("Spindle, WARMUP!"), e.embed_one("spindle warmup"));
}

#[test]
fn text_without_words_is_the_zero_vector() {
    let e = HashingEmbedder::new(32);
    assert!(e.embed_one("  ... !! ").iter().all(|x| *x == 0.0));
}

#[cfg(not(feature = "model"))]
#[test]
fn model_provider_requires_feature() {
    let config = EmbeddingConfig { provider: EmbeddingProviderKind::Model, ..EmbeddingConfig::default() };
    assert!(get_default_embedder(&config).is_err());
}
