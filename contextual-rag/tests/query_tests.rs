//! Property tests for answer confidence scoring.

use contextual_rag::document::{ContextualChunk, EmbeddedChunk, RelevantChunk};
use contextual_rag::query::confidence_score;
use proptest::prelude::*;

fn relevant(score: f32) -> RelevantChunk {
    let chunk = ContextualChunk::with_context("Context.", "body", 0, "a.txt").unwrap();
    RelevantChunk::new(EmbeddedChunk::new(chunk, vec![1.0]).unwrap(), score).unwrap()
}

/// *For any* similarity scores, confidence SHALL stay within `[0, 1]` and
/// SHALL never decrease when the mean similarity increases.
mod prop_confidence {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn confidence_is_bounded(scores in proptest::collection::vec(0.0f32..=1.0, 1..10)) {
            let chunks: Vec<RelevantChunk> = scores.iter().map(|s| relevant(*s)).collect();
            let confidence = confidence_score(&chunks);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }

        #[test]
        fn confidence_is_monotonic_in_similarity(a in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(confidence_score(&[relevant(low)]) <= confidence_score(&[relevant(high)]));
        }

        #[test]
        fn raising_one_score_never_lowers_confidence(
            scores in proptest::collection::vec(0.0f32..=0.9, 1..8),
            index in any::<prop::sample::Index>(),
            bump in 0.0f32..=0.1,
        ) {
            let before: Vec<RelevantChunk> = scores.iter().map(|s| relevant(*s)).collect();
            let mut raised = scores.clone();
            let i = index.index(raised.len());
            raised[i] += bump;
            let after: Vec<RelevantChunk> = raised.iter().map(|s| relevant(*s)).collect();
            prop_assert!(confidence_score(&before) <= confidence_score(&after) + 1e-6);
        }
    }
}

#[test]
fn no_chunks_means_no_confidence() {
    assert_eq!(confidence_score(&[]), 0.0);
}
