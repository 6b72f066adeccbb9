//! Tests for the file-backed document store: search ordering, isolation,
//! clearing and degraded reads.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use contextual_rag::document::{ContextualChunk, EmbeddedChunk, ProcessedDocument};
use contextual_rag::store::{DocumentStore, PLACEHOLDER_TEXT, cosine_similarity};
use proptest::prelude::*;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn document(filename: &str, text: &str, embeddings: Vec<Vec<f32>>, at: DateTime<Utc>) -> ProcessedDocument {
    let chunks = embeddings
        .into_iter()
        .enumerate()
        .map(|(i, embedding)| {
            let chunk = ContextualChunk::with_context(
                "Context.",
                format!("{filename} chunk {i}"),
                i,
                filename,
            )
            .unwrap();
            EmbeddedChunk::new(chunk, embedding).unwrap()
        })
        .collect();
    ProcessedDocument::new(filename, text, chunks, at).unwrap()
}

/// Generate a non-zero L2-normalized embedding of the given dimension.
fn arb_normalized_embedding(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0f32, dim).prop_filter_map(
        "non-zero embedding",
        |mut v| {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm < 1e-8 {
                return None;
            }
            for val in &mut v {
                *val /= norm;
            }
            Some(v)
        },
    )
}

/// *For any* set of stored documents, search SHALL return at most `top_k`
/// chunks, all scoring above the floor and within `[0, 1]`, in descending
/// score order with ties kept in insertion order.
mod prop_search_ordering {
    use super::*;

    const DIM: usize = 8;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn results_ordered_floored_and_bounded_by_top_k(
            docs in proptest::collection::vec(
                proptest::collection::vec(arb_normalized_embedding(DIM), 1..5),
                1..5,
            ),
            query in arb_normalized_embedding(DIM),
            top_k in 1usize..25,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (results, expected) = rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let store = DocumentStore::new(dir.path());
                for (i, embeddings) in docs.into_iter().enumerate() {
                    let at = base_time() + TimeDelta::seconds(i as i64);
                    let doc = document(&format!("doc{i}.txt"), "text", embeddings, at);
                    store.store("user", &doc).await.unwrap();
                }

                // Brute force over the stored embeddings, in insertion order.
                let mut expected: Vec<(String, f32)> = store
                    .list_documents("user")
                    .await
                    .value
                    .into_iter()
                    .flat_map(|d| d.chunks)
                    .map(|c| {
                        let score = cosine_similarity(&query, &c.embedding);
                        (c.contextual_chunk.original_text, score)
                    })
                    .filter(|(_, score)| *score > 0.1)
                    .collect();
                expected.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                expected.truncate(top_k);

                let read = store.search(&query, "user", top_k).await;
                assert!(read.is_clean());
                (read.value, expected)
            });

            prop_assert!(results.len() <= top_k);
            prop_assert_eq!(results.len(), expected.len());
            for window in results.windows(2) {
                prop_assert!(
                    window[0].similarity_score >= window[1].similarity_score,
                    "results not in descending order: {} < {}",
                    window[0].similarity_score,
                    window[1].similarity_score,
                );
            }
            for (result, (text, _)) in results.iter().zip(&expected) {
                prop_assert!(result.similarity_score > 0.1);
                prop_assert!(result.similarity_score <= 1.0);
                prop_assert_eq!(result.original_text(), text.as_str());
            }
        }
    }
}

#[tokio::test]
async fn equal_scores_keep_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    let first = document("first.txt", "one", vec![vec![1.0, 0.0]], base_time());
    let second =
        document("second.txt", "two", vec![vec![1.0, 0.0]], base_time() + TimeDelta::seconds(1));
    store.store("u1", &first).await.unwrap();
    store.store("u1", &second).await.unwrap();

    let hits = store.search(&[1.0, 0.0], "u1", 10).await.value;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document_filename(), "first.txt");
    assert_eq!(hits[1].document_filename(), "second.txt");
}

#[tokio::test]
async fn scores_at_or_below_floor_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path()).with_search_floor(0.5);
    let doc = document("a.txt", "text", vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]], base_time());
    store.store("u1", &doc).await.unwrap();

    let hits = store.search(&[1.0, 0.0], "u1", 10).await.value;
    let scores: Vec<f32> = hits.iter().map(|h| h.similarity_score).collect();
    assert_eq!(hits.len(), 2);
    assert!((scores[0] - 1.0).abs() < 1e-6);
    assert!((scores[1] - 0.6).abs() < 1e-6);
}

#[tokio::test]
async fn users_never_see_each_others_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    store.store("alice", &document("a.txt", "alice text", vec![vec![1.0]], base_time())).await.unwrap();

    assert!(store.list_documents("bob").await.value.is_empty());
    assert!(store.search(&[1.0], "bob", 10).await.value.is_empty());
    assert!(store.get_document("bob", "a.txt").await.value.is_none());
    assert_eq!(store.search(&[1.0], "alice", 10).await.value.len(), 1);
}

#[tokio::test]
async fn clear_is_idempotent_and_counts_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    store.store("u1", &document("a.txt", "text", vec![vec![1.0]], base_time())).await.unwrap();
    store.store("u1", &document("a.txt", "text", vec![vec![1.0]], base_time())).await.unwrap();
    store.store("u2", &document("b.txt", "text", vec![vec![1.0]], base_time())).await.unwrap();

    assert_eq!(store.clear("u1").await.unwrap(), 2);
    assert_eq!(store.clear("u1").await.unwrap(), 0);
    assert_eq!(store.clear("never-seen").await.unwrap(), 0);
    assert!(store.list_documents("u1").await.value.is_empty());
    assert_eq!(store.list_documents("u2").await.value.len(), 1);
}

#[tokio::test]
async fn same_filename_at_same_instant_gets_distinct_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    let doc = document("notes.md", "text", vec![vec![1.0]], base_time());

    let first = store.store("u1", &doc).await.unwrap();
    let second = store.store("u1", &doc).await.unwrap();
    assert_ne!(first, second);
    assert!(first < second);
    assert_eq!(store.list_documents("u1").await.value.len(), 2);
}

#[tokio::test]
async fn listing_uses_placeholder_and_get_document_loads_full_text() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    store.store("u1", &document("a.txt", "old text", vec![vec![1.0]], base_time())).await.unwrap();
    store
        .store(
            "u1",
            &document("a.txt", "new text", vec![vec![1.0]], base_time() + TimeDelta::minutes(5)),
        )
        .await
        .unwrap();

    let listed = store.list_documents("u1").await.value;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|d| d.original_text == PLACEHOLDER_TEXT));

    let latest = store.get_document("u1", "a.txt").await.value.unwrap();
    assert_eq!(latest.original_text, "new text");
    assert!(store.get_document("u1", "missing.txt").await.value.is_none());
}

#[tokio::test]
async fn corrupt_and_foreign_records_are_skipped_with_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    store.store("u1", &document("good.txt", "text", vec![vec![1.0]], base_time())).await.unwrap();

    // The only user directory under embeds/ belongs to u1.
    let embeds = std::fs::read_dir(dir.path().join("embeds")).unwrap().next().unwrap().unwrap().path();
    let valid = std::fs::read_dir(&embeds).unwrap().next().unwrap().unwrap().path();
    let contents = std::fs::read_to_string(&valid).unwrap();
    std::fs::write(embeds.join("zz_corrupt.json"), "{ not json").unwrap();
    std::fs::write(
        embeds.join("zz_future.json"),
        contents.replace("\"schema_version\":1", "\"schema_version\":2"),
    )
    .unwrap();

    let listed = store.list_documents("u1").await;
    assert_eq!(listed.value.len(), 1);
    assert_eq!(listed.warnings.len(), 2);
    assert!(listed.warnings.iter().any(|w| w.reason.contains("schema version 2")));

    let searched = store.search(&[1.0], "u1", 5).await;
    assert_eq!(searched.value.len(), 1);
    assert_eq!(searched.warnings.len(), 2);
}

#[tokio::test]
async fn ids_that_differ_only_in_punctuation_stay_apart() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    store.store("a/b", &document("slash.txt", "slash", vec![vec![1.0]], base_time())).await.unwrap();

    for other in ["a_b", "a?b", "a b"] {
        assert!(store.list_documents(other).await.value.is_empty(), "{other} sees a/b");
        assert!(store.search(&[1.0], other, 5).await.value.is_empty());
        assert!(store.get_document(other, "slash.txt").await.value.is_none());
        assert_eq!(store.clear(other).await.unwrap(), 0);
    }

    store.store("a_b", &document("under.txt", "under", vec![vec![1.0]], base_time())).await.unwrap();
    let names: Vec<String> =
        store.list_documents("a/b").await.value.into_iter().map(|d| d.filename).collect();
    assert_eq!(names, ["slash.txt"]);
}

#[tokio::test]
async fn long_ids_sharing_a_prefix_stay_apart() {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::new(dir.path());
    let first = format!("{}1", "x".repeat(100));
    let second = format!("{}2", "x".repeat(100));
    store.store(&first, &document("a.txt", "text", vec![vec![1.0]], base_time())).await.unwrap();

    assert!(store.list_documents(&second).await.value.is_empty());
    assert_eq!(store.clear(&second).await.unwrap(), 0);
    assert_eq!(store.list_documents(&first).await.value.len(), 1);
}
