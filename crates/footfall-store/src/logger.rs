//! Durable event logging with a bounded replay queue.
//!
//! Writes flow through one FIFO queue: visitor rows before the events that
//! reference them, events in emission order. A retryable store failure
//! leaves the write queued for the next flush, so identity decisions and
//! the live pipeline are never blocked by a database outage. Nothing is
//! dropped silently; queue overflow discards the oldest write with an
//! error log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use footfall_core::{Embedding, VisitEvent, VisitorId};

use crate::handle::StoreHandle;
use crate::store::StoreError;

const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone)]
enum PendingWrite {
    NewVisitor {
        visitor: VisitorId,
        embedding: Embedding,
        first_seen: DateTime<Utc>,
    },
    Seen {
        visitor: VisitorId,
        last_seen: DateTime<Utc>,
    },
    Event(VisitEvent),
}

/// Thin durable-append layer over [`StoreHandle`]. Performs no
/// deduplication: the state machine guarantees at most one entry and one
/// exit per transition.
pub struct EventLogger {
    store: StoreHandle,
    pending: VecDeque<PendingWrite>,
}

impl EventLogger {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            pending: VecDeque::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a new visitor row. Must be recorded before any event for that
    /// visitor; FIFO ordering takes care of that as long as the caller
    /// enqueues in emission order.
    pub async fn record_new_visitor(
        &mut self,
        visitor: VisitorId,
        embedding: Embedding,
        first_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.enqueue(PendingWrite::NewVisitor {
            visitor,
            embedding,
            first_seen,
        });
        self.flush().await
    }

    /// Queue a last-seen refresh.
    pub async fn record_visitor_seen(
        &mut self,
        visitor: VisitorId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.enqueue(PendingWrite::Seen { visitor, last_seen });
        self.flush().await
    }

    /// Queue an entry/exit event.
    pub async fn record_event(&mut self, event: VisitEvent) -> Result<(), StoreError> {
        self.enqueue(PendingWrite::Event(event));
        self.flush().await
    }

    fn enqueue(&mut self, write: PendingWrite) {
        if self.pending.len() == MAX_PENDING {
            error!("write queue overflow; dropping oldest pending write");
            self.pending.pop_front();
        }
        self.pending.push_back(write);
    }

    /// Drain the queue in order. Stops at the first retryable failure,
    /// leaving that write (and everything behind it) queued; a
    /// non-retryable failure on a single write is logged and the write
    /// discarded so it cannot wedge the queue.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        while let Some(write) = self.pending.pop_front() {
            match self.attempt(&write).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    debug!(pending = self.pending.len() + 1, error = %e,
                           "storage unavailable; keeping writes queued");
                    self.pending.push_front(write);
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "dropping unwritable store write");
                }
            }
        }
        Ok(())
    }

    async fn attempt(&self, write: &PendingWrite) -> Result<(), StoreError> {
        match write {
            PendingWrite::NewVisitor {
                visitor,
                embedding,
                first_seen,
            } => {
                self.store
                    .insert_visitor(*visitor, embedding.clone(), *first_seen)
                    .await
            }
            PendingWrite::Seen { visitor, last_seen } => {
                self.store.touch_visitor(*visitor, *last_seen).await
            }
            PendingWrite::Event(event) => {
                self.store.append_event(event.clone()).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::spawn;
    use crate::store::Store;
    use chrono::TimeZone;
    use footfall_core::EventKind;
    use std::time::Duration;

    fn logger() -> EventLogger {
        EventLogger::new(spawn(Store::open_in_memory().unwrap(), Duration::from_secs(5)))
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_visitor_then_events_in_order() {
        let mut logger = logger();
        let id = VisitorId::new();

        logger
            .record_new_visitor(id, Embedding::new(vec![1.0, 0.0]), at(9))
            .await
            .unwrap();
        logger
            .record_event(VisitEvent {
                visitor: id,
                kind: EventKind::Entry,
                timestamp: at(9),
                confidence: 0.9,
                crop_path: None,
            })
            .await
            .unwrap();
        logger.record_visitor_seen(id, at(10)).await.unwrap();
        logger
            .record_event(VisitEvent {
                visitor: id,
                kind: EventKind::Exit,
                timestamp: at(11),
                confidence: 0.9,
                crop_path: None,
            })
            .await
            .unwrap();

        assert_eq!(logger.pending_len(), 0);
        let events = logger.store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event.kind, EventKind::Entry);
        assert_eq!(events[0].event.kind, EventKind::Exit);
        let rows = logger.store.load_visitors().await.unwrap();
        assert_eq!(rows[0].last_seen, at(10));
    }

    #[tokio::test]
    async fn test_flush_drains_writes_queued_during_an_outage() {
        // A zero call timeout makes every write look like a busy store.
        let mut logger =
            EventLogger::new(spawn(Store::open_in_memory().unwrap(), Duration::ZERO));
        let id = VisitorId::new();

        let result = logger
            .record_new_visitor(id, Embedding::new(vec![1.0]), at(9))
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(logger.pending_len(), 1);

        // Store back within budget: a bare flush drains the queue without
        // waiting for the next write to arrive.
        logger.store.set_call_timeout(Duration::from_secs(5));
        logger.flush().await.unwrap();
        assert_eq!(logger.pending_len(), 0);
        assert_eq!(logger.store.visitor_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_write_is_dropped_not_wedged() {
        let mut logger = logger();
        let ghost = VisitorId::new();

        // Event for a visitor row that was never written: FK violation,
        // not retryable. The queue must come back empty.
        let result = logger
            .record_event(VisitEvent {
                visitor: ghost,
                kind: EventKind::Entry,
                timestamp: at(9),
                confidence: 0.5,
                crop_path: None,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(logger.pending_len(), 0);

        // Later writes still go through.
        let id = VisitorId::new();
        logger
            .record_new_visitor(id, Embedding::new(vec![1.0]), at(10))
            .await
            .unwrap();
        assert_eq!(logger.store.visitor_count().await.unwrap(), 1);
    }
}
