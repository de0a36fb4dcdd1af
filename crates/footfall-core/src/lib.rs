//! footfall-core — visitor identity resolution and entry/exit decisions.
//!
//! The pure decision layer of the footfall pipeline: matches face embeddings
//! produced by an external detector/tracker against a gallery of known
//! visitors, and debounces noisy per-frame presence into a small number of
//! entry/exit events. No I/O lives here; persistence and ingestion are the
//! concern of `footfall-store` and `footfalld`.

pub mod gallery;
pub mod pipeline;
pub mod resolver;
pub mod track;
pub mod types;

pub use gallery::{Gallery, GalleryError};
pub use pipeline::{FrameOutcome, NewVisitor, Pipeline, PipelineConfig, PipelineError};
pub use resolver::{IdentityResolver, Resolution, ResolveError};
pub use track::{RepresentativeStrategy, Sample, Track, TrackPhase};
pub use types::{
    BoundingBox, Detection, Embedding, EventKind, Frame, TrackId, VisitEvent, VisitorId,
};
