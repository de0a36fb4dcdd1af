//! Per-source pipeline: wires frames of tracker detections to tracks,
//! drives identity resolution, and debounces presence into entry/exit
//! events.
//!
//! One `Pipeline` serves one video source; it owns all track state and is
//! driven sequentially (`process_frame` per tracker frame, `tick` on a
//! timer). The anti-flicker core: a confirmed visitor who disappears only
//! becomes an exit after `exit_debounce` of continuous absence, measured by
//! observation timestamps, never frame counts. Reappearance within the
//! window — on the same track id or a new track resolving to the same
//! visitor — cancels the exit and emits no duplicate entry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gallery::GalleryError;
use crate::resolver::{IdentityResolver, ResolveError};
use crate::track::{RepresentativeStrategy, Sample, Track, TrackPhase};
use crate::types::{Embedding, EventKind, Frame, TrackId, VisitEvent, VisitorId};

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Dimension mismatch between the feed and the gallery; halts the
    /// pipeline instance.
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum continuous absence before an exit is considered real.
    pub exit_debounce: Duration,
    /// Observations buffered before the first resolution attempt.
    pub min_samples: usize,
    /// How buffered samples collapse into the probe embedding.
    pub strategy: RepresentativeStrategy,
    /// Tracks unobserved for this long are aged out as lost.
    pub track_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exit_debounce: Duration::seconds(3),
            min_samples: 1,
            strategy: RepresentativeStrategy::default(),
            track_timeout: Duration::seconds(10),
        }
    }
}

/// A visitor newly registered this frame; the caller must persist the row
/// before any event referencing it.
#[derive(Debug, Clone)]
pub struct NewVisitor {
    pub visitor: VisitorId,
    pub embedding: Embedding,
    pub first_seen: DateTime<Utc>,
}

/// Everything one frame produced that the caller must act on.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub events: Vec<VisitEvent>,
    pub new_visitors: Vec<NewVisitor>,
    /// One last-seen refresh per visitor observed this frame.
    pub seen: Vec<(VisitorId, DateTime<Utc>)>,
    /// Observations rejected for invalid embeddings.
    pub rejected: usize,
}

/// A visitor whose last confirmed track disappeared; exit pending debounce.
struct LostVisitor {
    lost_at: DateTime<Utc>,
    confidence: f32,
    crop_path: Option<String>,
    track: Track,
}

pub struct Pipeline {
    resolver: IdentityResolver,
    cfg: PipelineConfig,
    tracks: HashMap<TrackId, Track>,
    pending_exit: HashMap<VisitorId, LostVisitor>,
    /// Visitors with an entry logged for their current visit.
    open_visits: HashSet<VisitorId>,
    /// Highest frame timestamp processed so far.
    high_water: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(resolver: IdentityResolver, cfg: PipelineConfig) -> Self {
        Self {
            resolver,
            cfg,
            tracks: HashMap::new(),
            pending_exit: HashMap::new(),
            open_visits: HashSet::new(),
            high_water: None,
        }
    }

    /// Highest frame timestamp processed so far; the daemon uses it to
    /// keep the idle-feed clock from running behind the feed.
    pub fn latest_frame_timestamp(&self) -> Option<DateTime<Utc>> {
        self.high_water
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn pending_exits(&self) -> usize {
        self.pending_exit.len()
    }

    /// Whether the visitor is inside an open visit (entry logged, no exit
    /// yet).
    pub fn is_present(&self, visitor: VisitorId) -> bool {
        self.open_visits.contains(&visitor)
    }

    /// Process one frame of tracker output. Tracks absent from the frame
    /// count as lost for that frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, PipelineError> {
        self.high_water = Some(match self.high_water {
            Some(ts) => ts.max(frame.timestamp),
            None => frame.timestamp,
        });

        let mut out = FrameOutcome::default();
        // Settle debounce timers on the frame clock before looking at this
        // frame's detections. A backlogged feed then expires and cancels
        // exits in frame order, no matter how late the frames arrive.
        out.events = self.expire_due(frame.timestamp);
        let mut current: HashSet<TrackId> = HashSet::new();
        let mut visible: HashSet<VisitorId> = HashSet::new();

        for det in &frame.detections {
            // The tracker says this track is present even if the embedding
            // is unusable.
            current.insert(det.track_id);

            if !det.embedding.is_valid() {
                warn!(track = det.track_id, "rejecting observation with invalid embedding");
                out.rejected += 1;
                if let Some(v) = self.tracks.get(&det.track_id).and_then(Track::visitor) {
                    visible.insert(v);
                }
                continue;
            }

            let track = self
                .tracks
                .entry(det.track_id)
                .or_insert_with(|| Track::new(det.track_id, frame.timestamp));
            track.observe(
                Sample {
                    embedding: det.embedding.clone(),
                    confidence: det.confidence,
                    observed_at: frame.timestamp,
                },
                det.crop_path.clone(),
            );

            if track.ready_to_resolve(self.cfg.min_samples) {
                let Some(probe) = track.representative(self.cfg.strategy) else {
                    continue;
                };
                match self.resolver.resolve(&probe) {
                    Ok(res) => {
                        if res.is_new {
                            info!(visitor = %res.visitor, track = det.track_id,
                                  "registered new visitor");
                            out.new_visitors.push(NewVisitor {
                                visitor: res.visitor,
                                embedding: probe,
                                first_seen: frame.timestamp,
                            });
                        } else {
                            debug!(visitor = %res.visitor, track = det.track_id,
                                   similarity = res.similarity,
                                   "recognized returning visitor");
                        }
                        track.confirm(res.visitor);
                    }
                    Err(ResolveError::InvalidEmbedding) => {
                        // Representative came out degenerate (e.g. centroid
                        // of opposing samples); keep buffering.
                        warn!(track = det.track_id, "representative embedding invalid; deferring resolution");
                        out.rejected += 1;
                    }
                    Err(ResolveError::Gallery(e)) => return Err(e.into()),
                }
            }

            if let Some(v) = track.visitor() {
                visible.insert(v);
            }
        }

        for &v in &visible {
            out.seen.push((v, frame.timestamp));

            if self.pending_exit.remove(&v).is_some() {
                debug!(visitor = %v, "reappeared within debounce; exit cancelled");
            }

            // First confirmed sighting of this visit, across all tracks.
            if self.open_visits.insert(v) {
                let (confidence, crop_path) = self
                    .tracks
                    .values()
                    .find(|t| t.visitor() == Some(v))
                    .map(|t| (t.last_confidence(), t.last_crop().map(str::to_string)))
                    .unwrap_or((0.0, None));
                info!(visitor = %v, "entry");
                out.events.push(VisitEvent {
                    visitor: v,
                    kind: EventKind::Entry,
                    timestamp: frame.timestamp,
                    confidence,
                    crop_path,
                });
            }
        }

        let lost: Vec<TrackId> = self
            .tracks
            .keys()
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        for id in lost {
            self.retire_track(id, frame.timestamp, &visible);
        }

        Ok(out)
    }

    /// Expire debounce timers and age out stale tracks when the feed has
    /// gone quiet. Frames settle their own timers in `process_frame`, so
    /// callers should only tick an idle pipeline, with `now` no earlier
    /// than the latest frame timestamp.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<VisitEvent> {
        let stale: Vec<(TrackId, DateTime<Utc>)> = self
            .tracks
            .values()
            .filter(|t| t.is_stale(now, self.cfg.track_timeout))
            .map(|t| (t.id(), t.last_seen()))
            .collect();
        let nothing_visible = HashSet::new();
        for (id, last_seen) in stale {
            debug!(track = id, "track aged out without tracker loss signal");
            self.retire_track(id, last_seen, &nothing_visible);
        }

        self.expire_due(now)
    }

    /// Emit exits for pending departures whose debounce window has fully
    /// elapsed as of `now`.
    fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<VisitEvent> {
        let expired: Vec<VisitorId> = self
            .pending_exit
            .iter()
            .filter(|(_, lost)| now - lost.lost_at >= self.cfg.exit_debounce)
            .map(|(v, _)| *v)
            .collect();

        let mut events = Vec::with_capacity(expired.len());
        for v in expired {
            let Some(mut lost) = self.pending_exit.remove(&v) else {
                continue;
            };
            lost.track.mark_absent();
            lost.track.expire();
            self.open_visits.remove(&v);
            info!(visitor = %v, absent_for = %(now - lost.lost_at), "exit");
            events.push(VisitEvent {
                visitor: v,
                kind: EventKind::Exit,
                timestamp: now,
                confidence: lost.confidence,
                crop_path: lost.crop_path,
            });
        }
        events
    }

    /// Remove a track that the tracker no longer reports (or that aged
    /// out). A confirmed track whose visitor has no other live coverage
    /// starts the exit debounce; a pending track expires silently.
    fn retire_track(&mut self, id: TrackId, lost_at: DateTime<Utc>, visible: &HashSet<VisitorId>) {
        let Some(mut track) = self.tracks.remove(&id) else {
            return;
        };

        match (track.phase(), track.visitor()) {
            (TrackPhase::ConfirmedPresent, Some(v)) => {
                let covered = visible.contains(&v)
                    || self
                        .tracks
                        .values()
                        .any(|t| t.visitor() == Some(v) && t.phase() == TrackPhase::ConfirmedPresent);
                if covered || !self.open_visits.contains(&v) {
                    // Another track still covers this visitor.
                    return;
                }
                if !self.pending_exit.contains_key(&v) {
                    debug!(visitor = %v, track = id, "confirmed track lost; exit debounce started");
                    let confidence = track.last_confidence();
                    let crop_path = track.last_crop().map(str::to_string);
                    self.pending_exit.insert(
                        v,
                        LostVisitor {
                            lost_at,
                            confidence,
                            crop_path,
                            track,
                        },
                    );
                }
            }
            _ => {
                // Never resolved: no event was ever owed.
                track.expire();
                debug!(track = id, "pending track expired without resolution");
            }
        }
    }
}
