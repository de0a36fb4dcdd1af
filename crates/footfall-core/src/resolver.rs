//! Identity resolution: match a probe embedding to a known visitor or
//! register a new one.
//!
//! The whole resolve-or-create step runs under one gallery lock so that two
//! sources observing the same face concurrently cannot both decide "no
//! match" and create duplicate visitor rows.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::gallery::{Gallery, GalleryError};
use crate::types::{Embedding, VisitorId};

/// Two candidates whose similarities differ by less than this count as a
/// tie; ties resolve to the lowest visitor id for determinism.
const TIE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid embedding: zero norm or non-finite components")]
    InvalidEmbedding,
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Outcome of resolving one probe embedding.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub visitor: VisitorId,
    /// Best cosine similarity found in the gallery. For a new visitor this
    /// is the best *rejected* score (0.0 against an empty gallery).
    pub similarity: f32,
    pub is_new: bool,
}

/// Resolves probe embeddings against a shared gallery.
pub struct IdentityResolver {
    gallery: Arc<Mutex<Gallery>>,
    threshold: f32,
}

impl IdentityResolver {
    /// `threshold` is the match/no-match cutoff in (0, 1].
    pub fn new(gallery: Arc<Mutex<Gallery>>, threshold: f32) -> Self {
        Self { gallery, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn gallery_len(&self) -> usize {
        self.lock_gallery().len()
    }

    fn lock_gallery(&self) -> MutexGuard<'_, Gallery> {
        // A poisoned lock means another pipeline panicked mid-scan; the
        // gallery itself is never left half-written, so keep going.
        match self.gallery.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolve a probe to an existing visitor or register a new one.
    ///
    /// Linear scan over the whole gallery, max similarity wins; below the
    /// threshold a fresh visitor is allocated and the probe becomes its
    /// stored embedding.
    pub fn resolve(&self, probe: &Embedding) -> Result<Resolution, ResolveError> {
        if !probe.is_valid() {
            return Err(ResolveError::InvalidEmbedding);
        }

        let mut gallery = self.lock_gallery();
        gallery.check_dim(probe)?;

        let mut best: Option<(VisitorId, f32)> = None;
        for (id, stored) in gallery.iter() {
            let sim = probe.similarity(stored);
            let better = match best {
                None => true,
                Some((best_id, best_sim)) => {
                    sim > best_sim + TIE_EPSILON
                        || ((sim - best_sim).abs() <= TIE_EPSILON && id < best_id)
                }
            };
            if better {
                best = Some((id, sim));
            }
        }

        if let Some((id, sim)) = best {
            if sim >= self.threshold {
                return Ok(Resolution {
                    visitor: id,
                    similarity: sim,
                    is_new: false,
                });
            }
        }

        let visitor = VisitorId::new();
        gallery.upsert(visitor, probe.clone())?;
        Ok(Resolution {
            visitor,
            similarity: best.map(|(_, sim)| sim).unwrap_or(0.0),
            is_new: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(dim: usize, rows: Vec<(VisitorId, Embedding)>, threshold: f32) -> IdentityResolver {
        let gallery = Gallery::from_rows(dim, rows).unwrap();
        IdentityResolver::new(Arc::new(Mutex::new(gallery)), threshold)
    }

    #[test]
    fn test_below_threshold_creates_exactly_one_visitor() {
        let known = VisitorId::new();
        let resolver = resolver_with(
            2,
            vec![(known, Embedding::new(vec![1.0, 0.0]))],
            0.6,
        );

        let res = resolver.resolve(&Embedding::new(vec![0.0, 1.0])).unwrap();
        assert!(res.is_new);
        assert_ne!(res.visitor, known);
        assert_eq!(resolver.gallery_len(), 2);

        // The existing entry is untouched.
        let gallery = resolver.gallery.lock().unwrap();
        let stored = gallery
            .iter()
            .find(|(id, _)| *id == known)
            .map(|(_, e)| e.clone())
            .unwrap();
        assert_eq!(stored.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_above_threshold_matches_without_growing_gallery() {
        let known = VisitorId::new();
        let resolver = resolver_with(
            2,
            vec![(known, Embedding::new(vec![1.0, 0.0]))],
            0.6,
        );

        let res = resolver.resolve(&Embedding::new(vec![0.9, 0.1])).unwrap();
        assert!(!res.is_new);
        assert_eq!(res.visitor, known);
        assert!(res.similarity > 0.9);
        assert_eq!(resolver.gallery_len(), 1);
    }

    #[test]
    fn test_ties_resolve_to_lowest_visitor_id() {
        let a = VisitorId::new();
        let b = VisitorId::new();
        let lowest = a.min(b);
        let same = Embedding::new(vec![1.0, 0.0]);
        let resolver = resolver_with(2, vec![(a, same.clone()), (b, same.clone())], 0.6);

        for _ in 0..4 {
            let res = resolver.resolve(&same).unwrap();
            assert!(!res.is_new);
            assert_eq!(res.visitor, lowest);
        }
    }

    #[test]
    fn test_zero_norm_probe_is_rejected() {
        let resolver = resolver_with(2, vec![], 0.6);
        let err = resolver.resolve(&Embedding::new(vec![0.0, 0.0])).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidEmbedding));
        assert_eq!(resolver.gallery_len(), 0);
    }

    #[test]
    fn test_wrong_dimension_is_fatal_not_a_match() {
        let resolver = resolver_with(3, vec![], 0.6);
        let err = resolver.resolve(&Embedding::new(vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, ResolveError::Gallery(_)));
    }

    #[test]
    fn test_resolution_is_deterministic_against_fixed_gallery() {
        let known = VisitorId::new();
        let resolver = resolver_with(
            2,
            vec![(known, Embedding::new(vec![1.0, 0.0]))],
            0.6,
        );
        let probe = Embedding::new(vec![0.8, 0.2]);

        let first = resolver.resolve(&probe).unwrap();
        let second = resolver.resolve(&probe).unwrap();
        assert_eq!(first.visitor, second.visitor);
        assert_eq!(first.is_new, second.is_new);
        assert_eq!(first.similarity, second.similarity);
    }
}
