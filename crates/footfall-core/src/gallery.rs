//! In-memory gallery of known visitor embeddings.
//!
//! Bulk-loaded from the visitors table at startup and kept in sync as new
//! visitors are registered. The surface is deliberately scan-shaped: a
//! linear pass over every entry, which is the documented design point up to
//! tens of thousands of visitors. An indexed nearest-neighbor structure can
//! replace the internals without touching the resolver.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{Embedding, VisitorId};

#[derive(Error, Debug)]
pub enum GalleryError {
    /// The gallery dimension is fixed at creation; any other dimension is a
    /// configuration error, not a per-call failure.
    #[error("embedding dimension mismatch: gallery is {expected}-dimensional, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Fixed-dimension gallery of `(visitor, embedding)` pairs.
pub struct Gallery {
    dim: usize,
    entries: Vec<(VisitorId, Embedding)>,
    by_id: HashMap<VisitorId, usize>,
}

impl Gallery {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Build a gallery from persisted visitor rows.
    pub fn from_rows<I>(dim: usize, rows: I) -> Result<Self, GalleryError>
    where
        I: IntoIterator<Item = (VisitorId, Embedding)>,
    {
        let mut gallery = Self::new(dim);
        for (id, embedding) in rows {
            gallery.upsert(id, embedding)?;
        }
        Ok(gallery)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &VisitorId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Verify a probe embedding matches the gallery dimension.
    pub fn check_dim(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.dim() != self.dim {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dim,
                got: embedding.dim(),
            });
        }
        Ok(())
    }

    /// Store or replace a visitor's embedding.
    pub fn upsert(&mut self, id: VisitorId, embedding: Embedding) -> Result<(), GalleryError> {
        self.check_dim(&embedding)?;
        match self.by_id.get(&id) {
            Some(&idx) => self.entries[idx].1 = embedding,
            None => {
                self.by_id.insert(id, self.entries.len());
                self.entries.push((id, embedding));
            }
        }
        Ok(())
    }

    /// Linear scan over every stored entry.
    pub fn iter(&self) -> impl Iterator<Item = (VisitorId, &Embedding)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }
}
