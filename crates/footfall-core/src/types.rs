use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transient track identifier assigned by the external tracker.
///
/// Track ids are short-lived correlation handles, never durable identity;
/// durable identity is [`VisitorId`], reached only through resolution.
pub type TrackId = u64;

/// Durable, opaque visitor identifier.
///
/// Ordered so that similarity ties can be broken deterministically
/// (lowest id wins).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VisitorId(Uuid);

impl VisitorId {
    /// Allocate a fresh random visitor id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a visitor id from its string form (e.g., a database column).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for VisitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bounding box for a detected face, in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (typically 512-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Whether this embedding is usable as a probe: all components finite
    /// and norm strictly positive. Degenerate vectors must be rejected,
    /// never silently matched.
    pub fn is_valid(&self) -> bool {
        !self.values.is_empty()
            && self.values.iter().all(|v| v.is_finite())
            && self.l2_norm() > 0.0
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Element-wise mean of a set of embeddings. Returns `None` for an
    /// empty set or mismatched dimensions.
    pub fn centroid<'a, I>(embeddings: I) -> Option<Embedding>
    where
        I: IntoIterator<Item = &'a Embedding>,
    {
        let mut iter = embeddings.into_iter();
        let first = iter.next()?;
        let mut sum = first.values.clone();
        let mut count = 1usize;

        for e in iter {
            if e.dim() != sum.len() {
                return None;
            }
            for (acc, v) in sum.iter_mut().zip(e.values.iter()) {
                *acc += v;
            }
            count += 1;
        }

        let n = count as f32;
        for v in sum.iter_mut() {
            *v /= n;
        }
        Some(Embedding::new(sum))
    }
}

/// One face detection reported by the tracker for a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub track_id: TrackId,
    pub embedding: Embedding,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Path to a saved face crop, if the capture side wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_path: Option<String>,
}

/// All detections the tracker reported for one frame. A track id absent
/// from a frame counts as lost for that frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Kind of visit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(EventKind::Entry),
            "exit" => Some(EventKind::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable entry/exit fact, ready to be appended to the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitEvent {
    pub visitor: VisitorId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_path: Option<String>,
}
