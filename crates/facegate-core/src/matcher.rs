//! Nearest-neighbour identity resolution over a gallery snapshot.
//!
//! A linear scan: every query is compared with every gallery embedding. That
//! is fine for tens to low thousands of embeddings; beyond that an
//! approximate-nearest-neighbour index would replace the scan.

use crate::types::{Embedding, GalleryEntry, MatchResult};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("query embedding is empty")]
    EmptyQuery,
    #[error("query embedding has a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher.
///
/// Scans the whole gallery in iteration order and keeps the first entry that
/// reaches the highest score, so ties go to whichever entry the store listed
/// first. The threshold only decides acceptance, never which identity wins.
/// Entries produced by a different model version are skipped, and so are
/// entries whose dimension differs from the query or that hold non-finite
/// values; only a malformed query is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_best_match(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        validate_query(query)?;

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut compared = 0usize;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.model_version() != query.model_version() {
                tracing::trace!(
                    identity = %entry.identity,
                    version = entry.embedding.model_version(),
                    "skipping embedding from another model version"
                );
                continue;
            }
            if entry.embedding.dim() != query.dim() || !entry.embedding.is_well_formed() {
                tracing::warn!(
                    identity = %entry.identity,
                    expected = query.dim(),
                    actual = entry.embedding.dim(),
                    "skipping malformed gallery embedding"
                );
                continue;
            }

            compared += 1;
            let sim = query.similarity(&entry.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity: Some(gallery[idx].identity.clone()),
                compared,
            },
            Some(_) => MatchResult::no_match(best_sim, compared),
            None => MatchResult::no_match(0.0, compared),
        };

        tracing::debug!(
            matched = result.matched,
            similarity = result.similarity,
            compared,
            threshold,
            "gallery scan complete"
        );

        Ok(result)
    }
}

fn validate_query(query: &Embedding) -> Result<(), MatchError> {
    if query.values().is_empty() {
        return Err(MatchError::EmptyQuery);
    }
    if let Some(idx) = query.first_non_finite() {
        return Err(MatchError::NonFinite(idx));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityId;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "v1")
    }

    fn entry(id: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            identity: IdentityId::from(id),
            embedding: emb(values),
        }
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            entry("AAAAAA", &[0.0, 1.0, 0.0]),
            entry("BBBBBB", &[0.0, 0.0, 1.0]),
            entry("CCCCCC", &[1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity, Some(IdentityId::from("CCCCCC")));
        assert!((result.similarity - 1.0).abs() < 1e-6);
        assert_eq!(result.compared, 3);
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let gallery = vec![entry("AAAAAA", &[0.0, 1.0, 0.0])];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(!result.matched);
        assert!(result.identity.is_none());
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        for threshold in [-2.0, -1.0, 0.0, 0.5, 1.0] {
            let result = CosineMatcher
                .find_best_match(&emb(&[1.0, 0.0]), &[], threshold)
                .unwrap();
            assert!(!result.matched);
            assert_eq!(result.similarity, 0.0);
            assert_eq!(result.compared, 0);
        }
    }

    #[test]
    fn test_query_equal_to_member_matches_for_any_gallery_size() {
        for k in 1..=8usize {
            let gallery: Vec<GalleryEntry> = (0..k)
                .map(|i| {
                    let mut v = vec![0.0f32; 8];
                    v[i] = 1.0;
                    v[(i + 1) % 8] = 0.25;
                    entry(&format!("ID{i:04}"), &v)
                })
                .collect();
            let j = k / 2;
            let query = gallery[j].embedding.clone();
            for threshold in [-1.0, 0.0, 0.5, 0.99, 1.0] {
                let result = CosineMatcher.find_best_match(&query, &gallery, threshold).unwrap();
                assert!(result.matched, "k={k} threshold={threshold}");
                assert_eq!(result.identity.as_ref(), Some(&gallery[j].identity));
                assert!((result.similarity - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_tie_keeps_first_entry() {
        let gallery = vec![
            entry("FIRST1", &[2.0, 0.0]),
            entry("SECOND", &[5.0, 0.0]),
            entry("THIRD3", &[1.0, 0.0]),
        ];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0]), &gallery, 0.0)
            .unwrap();
        assert_eq!(result.identity, Some(IdentityId::from("FIRST1")));
    }

    #[test]
    fn test_threshold_monotonic() {
        let gallery = vec![
            entry("AAAAAA", &[0.9, 0.1, 0.0]),
            entry("BBBBBB", &[0.6, 0.8, 0.0]),
            entry("CCCCCC", &[0.0, 0.2, 0.9]),
        ];
        let query = emb(&[0.7, 0.5, 0.1]);

        let mut previously_matched = true;
        let mut winner: Option<IdentityId> = None;
        let mut t = -1.0f32;
        while t <= 1.0 {
            let result = CosineMatcher.find_best_match(&query, &gallery, t).unwrap();
            // Once rejected, a higher threshold never accepts again.
            assert!(previously_matched || !result.matched, "threshold {t}");
            previously_matched = result.matched;
            if let Some(id) = result.identity {
                if let Some(prev) = &winner {
                    assert_eq!(prev, &id);
                }
                winner = Some(id);
            }
            t += 0.05;
        }
        assert!(winner.is_some());
    }

    #[test]
    fn test_skips_other_model_versions() {
        let gallery = vec![
            GalleryEntry {
                identity: IdentityId::from("LEGACY"),
                embedding: Embedding::new(vec![1.0, 0.0], "v0"),
            },
            entry("CURRNT", &[0.8, 0.6]),
        ];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert_eq!(result.identity, Some(IdentityId::from("CURRNT")));
        assert_eq!(result.compared, 1);
    }

    #[test]
    fn test_malformed_query_is_rejected() {
        let gallery = vec![entry("AAAAAA", &[1.0, 0.0])];
        assert_eq!(
            CosineMatcher.find_best_match(&emb(&[]), &gallery, 0.5).unwrap_err(),
            MatchError::EmptyQuery
        );
        assert_eq!(
            CosineMatcher
                .find_best_match(&emb(&[1.0, f32::NAN]), &gallery, 0.5)
                .unwrap_err(),
            MatchError::NonFinite(1)
        );
    }

    #[test]
    fn test_malformed_gallery_entries_are_skipped() {
        let gallery = vec![
            entry("SHORT1", &[1.0, 0.0]),
            entry("NANROW", &[1.0, f32::NAN, 0.0]),
            entry("GOOD00", &[0.8, 0.6, 0.0]),
        ];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.identity, Some(IdentityId::from("GOOD00")));
        assert_eq!(result.compared, 1);

        let only_bad = &gallery[..2];
        let result = CosineMatcher
            .find_best_match(&emb(&[1.0, 0.0, 0.0]), only_bad, -1.0)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.compared, 0);
    }

    #[test]
    fn test_zero_query_never_divides_by_zero() {
        let gallery = vec![entry("AAAAAA", &[1.0, 0.0])];
        let result = CosineMatcher
            .find_best_match(&emb(&[0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }
}
