//! Async access to the store via a dedicated OS thread.
//!
//! The SQLite connection lives on one named thread that services requests
//! from an mpsc channel; callers get a clone-safe [`StoreHandle`] whose
//! calls carry a timeout, so no pipeline ever blocks indefinitely on the
//! database.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use footfall_core::{Embedding, VisitEvent, VisitorId};

use crate::store::{DailyCount, EventRow, Store, StoreError, VisitorRow, VisitorSummary};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum StoreRequest {
    LoadVisitors {
        reply: Reply<Vec<VisitorRow>>,
    },
    InsertVisitor {
        visitor: VisitorId,
        embedding: Embedding,
        first_seen: DateTime<Utc>,
        reply: Reply<()>,
    },
    TouchVisitor {
        visitor: VisitorId,
        last_seen: DateTime<Utc>,
        reply: Reply<()>,
    },
    AppendEvent {
        event: VisitEvent,
        reply: Reply<i64>,
    },
    VisitorCount {
        reply: Reply<i64>,
    },
    DailyCounts {
        days: u32,
        reply: Reply<Vec<DailyCount>>,
    },
    VisitorSummaries {
        reply: Reply<Vec<VisitorSummary>>,
    },
    RecentEvents {
        limit: u32,
        reply: Reply<Vec<EventRow>>,
    },
}

/// Clone-safe handle to the store thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreRequest>,
    call_timeout: Duration,
}

/// Open the database (fail-fast) and spawn the store thread.
pub fn spawn_store(path: &Path, call_timeout: Duration) -> Result<StoreHandle, StoreError> {
    let store = Store::open(path)?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(spawn(store, call_timeout))
}

/// Spawn the store thread around an already-open store.
pub fn spawn(store: Store, call_timeout: Duration) -> StoreHandle {
    let (tx, mut rx) = mpsc::channel::<StoreRequest>(64);

    std::thread::Builder::new()
        .name("footfall-store".into())
        .spawn(move || {
            tracing::info!("store thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    StoreRequest::LoadVisitors { reply } => {
                        let _ = reply.send(store.load_visitors());
                    }
                    StoreRequest::InsertVisitor {
                        visitor,
                        embedding,
                        first_seen,
                        reply,
                    } => {
                        let _ = reply.send(store.insert_visitor(visitor, &embedding, first_seen));
                    }
                    StoreRequest::TouchVisitor {
                        visitor,
                        last_seen,
                        reply,
                    } => {
                        let _ = reply.send(store.touch_visitor(visitor, last_seen));
                    }
                    StoreRequest::AppendEvent { event, reply } => {
                        let _ = reply.send(store.append_event(&event));
                    }
                    StoreRequest::VisitorCount { reply } => {
                        let _ = reply.send(store.visitor_count());
                    }
                    StoreRequest::DailyCounts { days, reply } => {
                        let _ = reply.send(store.daily_counts(days));
                    }
                    StoreRequest::VisitorSummaries { reply } => {
                        let _ = reply.send(store.visitor_summaries());
                    }
                    StoreRequest::RecentEvents { limit, reply } => {
                        let _ = reply.send(store.recent_events(limit));
                    }
                }
            }
            tracing::info!("store thread exiting");
        })
        .expect("failed to spawn store thread");

    StoreHandle { tx, call_timeout }
}

impl StoreHandle {
    /// Replace the per-call timeout on this handle. Clones keep their own.
    pub fn set_call_timeout(&mut self, call_timeout: Duration) {
        self.call_timeout = call_timeout;
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(StoreError::Timeout),
            Ok(Err(_)) => Err(StoreError::ChannelClosed),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn load_visitors(&self) -> Result<Vec<VisitorRow>, StoreError> {
        self.call(|reply| StoreRequest::LoadVisitors { reply }).await
    }

    pub async fn insert_visitor(
        &self,
        visitor: VisitorId,
        embedding: Embedding,
        first_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.call(|reply| StoreRequest::InsertVisitor {
            visitor,
            embedding,
            first_seen,
            reply,
        })
        .await
    }

    pub async fn touch_visitor(
        &self,
        visitor: VisitorId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.call(|reply| StoreRequest::TouchVisitor {
            visitor,
            last_seen,
            reply,
        })
        .await
    }

    pub async fn append_event(&self, event: VisitEvent) -> Result<i64, StoreError> {
        self.call(|reply| StoreRequest::AppendEvent { event, reply })
            .await
    }

    pub async fn visitor_count(&self) -> Result<i64, StoreError> {
        self.call(|reply| StoreRequest::VisitorCount { reply }).await
    }

    pub async fn daily_counts(&self, days: u32) -> Result<Vec<DailyCount>, StoreError> {
        self.call(|reply| StoreRequest::DailyCounts { days, reply })
            .await
    }

    pub async fn visitor_summaries(&self) -> Result<Vec<VisitorSummary>, StoreError> {
        self.call(|reply| StoreRequest::VisitorSummaries { reply })
            .await
    }

    pub async fn recent_events(&self, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.call(|reply| StoreRequest::RecentEvents { limit, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use footfall_core::EventKind;

    fn handle() -> StoreHandle {
        spawn(Store::open_in_memory().unwrap(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_round_trip_through_the_store_thread() {
        let store = handle();
        let id = VisitorId::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        store
            .insert_visitor(id, Embedding::new(vec![1.0, 0.0]), at)
            .await
            .unwrap();
        store
            .append_event(VisitEvent {
                visitor: id,
                kind: EventKind::Entry,
                timestamp: at,
                confidence: 0.8,
                crop_path: None,
            })
            .await
            .unwrap();

        assert_eq!(store.visitor_count().await.unwrap(), 1);
        let rows = store.load_visitors().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].visitor, id);
        let events = store.recent_events(5).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.visitor, id);
    }

    #[tokio::test]
    async fn test_clones_share_one_store() {
        let store = handle();
        let other = store.clone();
        let id = VisitorId::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        store
            .insert_visitor(id, Embedding::new(vec![1.0]), at)
            .await
            .unwrap();
        assert_eq!(other.visitor_count().await.unwrap(), 1);
    }
}
