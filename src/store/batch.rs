use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::limits::*;
use crate::model::*;

use super::{RecordStore, StoreError};

/// Run `op` until it stops being throttled.
///
/// Waits the server-indicated duration when given, otherwise an exponential
/// backoff starting at `base_backoff`. The same request is replayed on every
/// attempt. After `max_retries` retries the error becomes `RetriesExhausted`.
pub async fn retry_throttled<T, F, Fut>(
    max_retries: u32,
    base_backoff: Duration,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let cap = Duration::from_millis(MAX_BACKOFF_MS);
    let mut backoff = base_backoff;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(StoreError::Throttled { retry_after }) => {
                if attempt >= max_retries {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt + 1,
                    });
                }
                attempt += 1;
                let wait = retry_after.unwrap_or(backoff).min(cap);
                warn!(
                    "store throttled, retry {attempt}/{max_retries} in {}ms",
                    wait.as_millis()
                );
                metrics::counter!(crate::observability::STORE_RETRIES_TOTAL).increment(1);
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(cap);
            }
            other => return other,
        }
    }
}

/// Tallies for the writes a `BatchWriter` sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub created: usize,
    pub updated: usize,
    /// Batches the store rejected, plus successors held back because a
    /// retirement they depend on was rejected.
    pub failed_batches: usize,
}

/// A queued create and the retirements that must land before it.
#[derive(Debug)]
struct QueuedCreate {
    fields: RecordFields,
    after: Vec<RecordId>,
}

/// Buffers creates and updates and sends them in bounded batches.
///
/// Queues flush when full and on `flush()`. A batch that fails with anything
/// other than throttling is logged and dropped; throttling is retried in
/// place and, once exhausted, aborts the caller. A successor whose retirement
/// was dropped is dropped with it.
pub struct BatchWriter<S: RecordStore + ?Sized> {
    store: Arc<S>,
    batch_size: usize,
    max_retries: u32,
    base_backoff: Duration,
    creates: Vec<QueuedCreate>,
    updates: Vec<RecordUpdate>,
    /// Ids whose update batch was rejected this run.
    rejected: HashSet<RecordId>,
    stats: FlushStats,
}

impl<S: RecordStore + ?Sized> BatchWriter<S> {
    pub fn new(store: Arc<S>, batch_size: usize, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            max_retries,
            base_backoff,
            creates: Vec::new(),
            updates: Vec::new(),
            rejected: HashSet::new(),
            stats: FlushStats::default(),
        }
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.creates.len() + self.updates.len()
    }

    pub async fn push_create(&mut self, fields: RecordFields) -> Result<(), StoreError> {
        self.push_successor(fields, Vec::new()).await
    }

    /// Queue a create that is only sent if every update to `after` landed.
    pub async fn push_successor(
        &mut self,
        fields: RecordFields,
        after: Vec<RecordId>,
    ) -> Result<(), StoreError> {
        self.creates.push(QueuedCreate { fields, after });
        if self.creates.len() >= self.batch_size {
            // A successor never goes out before the retirement queued ahead of it.
            self.flush_updates().await?;
            self.flush_creates().await?;
        }
        Ok(())
    }

    pub async fn push_update(&mut self, update: RecordUpdate) -> Result<(), StoreError> {
        self.updates.push(update);
        if self.updates.len() >= self.batch_size {
            self.flush_updates().await?;
        }
        Ok(())
    }

    /// Send everything queued. Retirements go out before their successors.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.flush_updates().await?;
        self.flush_creates().await
    }

    async fn flush_updates(&mut self) -> Result<(), StoreError> {
        while !self.updates.is_empty() {
            let take = self.updates.len().min(self.batch_size);
            let batch: Vec<RecordUpdate> = self.updates.drain(..take).collect();
            let size = batch.len();
            metrics::histogram!(crate::observability::STORE_FLUSH_BATCH_SIZE).record(size as f64);
            let store = self.store.clone();
            let result = retry_throttled(self.max_retries, self.base_backoff, || {
                let store = store.clone();
                let batch = batch.clone();
                async move { store.batch_update(batch).await }
            })
            .await;
            match result {
                Ok(()) => self.stats.updated += size,
                Err(e) => {
                    self.absorb_failure("update", size, e)?;
                    self.rejected.extend(batch.iter().map(|u| u.id));
                }
            }
        }
        Ok(())
    }

    async fn flush_creates(&mut self) -> Result<(), StoreError> {
        self.hold_back_orphans();
        while !self.creates.is_empty() {
            let take = self.creates.len().min(self.batch_size);
            let batch: Vec<RecordFields> = self.creates.drain(..take).map(|c| c.fields).collect();
            let size = batch.len();
            metrics::histogram!(crate::observability::STORE_FLUSH_BATCH_SIZE).record(size as f64);
            let store = self.store.clone();
            let result = retry_throttled(self.max_retries, self.base_backoff, || {
                let store = store.clone();
                let batch = batch.clone();
                async move { store.batch_create(batch).await }
            })
            .await;
            match result {
                Ok(created) => self.stats.created += created.len(),
                Err(e) => self.absorb_failure("create", size, e)?,
            }
        }
        Ok(())
    }

    /// Drop queued successors whose retirement was rejected, so the old row
    /// stays the only active one and the next run clones again.
    fn hold_back_orphans(&mut self) {
        if self.rejected.is_empty() {
            return;
        }
        let rejected = &self.rejected;
        let before = self.creates.len();
        self.creates.retain(|c| {
            let orphaned = c.after.iter().any(|id| rejected.contains(id));
            if orphaned {
                warn!(
                    "successor for '{}' held back: its retirement was rejected",
                    c.fields.entity_uid
                );
            }
            !orphaned
        });
        let dropped = before - self.creates.len();
        if dropped > 0 {
            metrics::counter!(crate::observability::STORE_BATCHES_FAILED_TOTAL)
                .increment(dropped as u64);
            self.stats.failed_batches += dropped;
        }
    }

    /// Exhausted retries propagate and drop every later queued write; any
    /// other failure only loses this batch.
    fn absorb_failure(&mut self, op: &str, size: usize, e: StoreError) -> Result<(), StoreError> {
        if matches!(e, StoreError::RetriesExhausted { .. }) {
            self.creates.clear();
            self.updates.clear();
            return Err(e);
        }
        error!("{op} batch of {size} failed, not retried: {e}");
        metrics::counter!(crate::observability::STORE_BATCHES_FAILED_TOTAL).increment(1);
        self.stats.failed_batches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, RecordFilter};
    use chrono::NaiveDate;

    fn fields(uid: &str) -> RecordFields {
        RecordFields {
            entity_uid: uid.into(),
            upstream_uid: uid.into(),
            feed_identifier: "feed-1".into(),
            property_ref: None,
            span: DateSpan::new(
                NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 6, 5).unwrap(),
            ),
            entry_kind: EntryKind::Reservation,
            service_kind: ServiceKind::Turnover,
            source_platform: Platform::Generic,
            overlapping: false,
            same_day_turnover: false,
            upstream_same_day_override: None,
            metadata: Metadata::new(),
            lifecycle_status: LifecycleStatus::New,
            carried_fields: CarriedFields::new(),
        }
    }

    fn writer(store: &Arc<InMemoryStore>, batch_size: usize, retries: u32) -> BatchWriter<InMemoryStore> {
        BatchWriter::new(store.clone(), batch_size, retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn flushes_when_full_and_on_demand() {
        let store = Arc::new(InMemoryStore::new());
        let mut w = writer(&store, 3, 0);
        for i in 0..4 {
            w.push_create(fields(&format!("u{i}"))).await.unwrap();
        }
        assert_eq!(store.record_count(), 3);
        assert_eq!(w.pending(), 1);
        w.flush().await.unwrap();
        assert_eq!(store.record_count(), 4);
        assert_eq!(store.mutation_count(), 2);
        assert_eq!(w.stats().created, 4);
    }

    #[tokio::test]
    async fn throttled_batch_is_retried_whole() {
        let store = Arc::new(InMemoryStore::new());
        store.throttle_next(2, None);
        let mut w = writer(&store, 5, 4);
        w.push_create(fields("a")).await.unwrap();
        w.push_create(fields("b")).await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(store.record_count(), 2);
        assert_eq!(store.mutation_count(), 1);
    }

    #[tokio::test]
    async fn server_retry_after_is_respected() {
        let store = Arc::new(InMemoryStore::new());
        store.throttle_next(1, Some(Duration::from_millis(30)));
        let mut w = writer(&store, 5, 2);
        w.push_create(fields("a")).await.unwrap();
        let started = std::time::Instant::now();
        w.flush().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_abort_and_drop_later_batches() {
        let store = Arc::new(InMemoryStore::new());
        store.throttle_next(10, None);
        let mut w = writer(&store, 1, 2);
        let result = w.push_create(fields("a")).await;
        assert!(matches!(result, Err(StoreError::RetriesExhausted { attempts: 3 })));
        assert_eq!(w.pending(), 0);
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn backend_failure_drops_only_that_batch() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_batches(1);
        let mut w = writer(&store, 1, 2);
        w.push_create(fields("a")).await.unwrap();
        w.push_create(fields("b")).await.unwrap();
        w.flush().await.unwrap();
        let rows = store.query(&RecordFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.entity_uid, "b");
        assert_eq!(w.stats().failed_batches, 1);
    }

    #[tokio::test]
    async fn successor_is_dropped_with_its_rejected_retirement() {
        let store = Arc::new(InMemoryStore::new());
        let old = store.create(fields("a")).await.unwrap();
        store.fail_next_batches(1);
        let mut w = writer(&store, 5, 0);
        w.push_update(RecordUpdate {
            id: old.id,
            lifecycle_status: Some(LifecycleStatus::Old),
            carried_fields: None,
        })
        .await
        .unwrap();
        let mut successor = fields("a");
        successor.lifecycle_status = LifecycleStatus::Modified;
        w.push_successor(successor, vec![old.id]).await.unwrap();
        w.push_create(fields("b")).await.unwrap();
        w.flush().await.unwrap();

        let rows = store.query(&RecordFilter::default().active()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.id == old.id && r.status() == LifecycleStatus::New));
        assert!(rows.iter().any(|r| r.fields.entity_uid == "b"));
        assert_eq!(w.stats().failed_batches, 2);
        assert_eq!(w.stats().created, 1);
    }
}
