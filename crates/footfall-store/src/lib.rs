//! footfall-store — SQLite persistence for visitors and visit events.
//!
//! The database is owned by a dedicated store thread; async callers talk to
//! it through [`StoreHandle`] with a per-call timeout. [`EventLogger`] sits
//! on top and keeps a bounded replay queue so a database outage never blocks
//! or corrupts the in-memory pipeline.

pub mod handle;
pub mod logger;
pub mod store;

pub use handle::{spawn_store, StoreHandle};
pub use logger::EventLogger;
pub use store::{DailyCount, EventRow, Store, StoreError, VisitorRow, VisitorSummary};
