use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{RecordFilter, RecordStore, StoreError};

/// Record store held in memory, optionally made durable by a WAL.
///
/// Also the deterministic double used by tests: throttling and batch
/// failures can be injected, and every accepted mutation is counted.
pub struct InMemoryStore {
    records: DashMap<RecordId, PersistedRecord>,
    properties: DashMap<PropertyId, Property>,
    /// Keyed by lowercased pattern.
    overrides: DashMap<String, GuestOverride>,
    wal: Option<tokio::sync::Mutex<Wal>>,
    /// Last issued timestamp; stamps are strictly increasing.
    clock: Mutex<DateTime<Utc>>,
    mutations: AtomicU64,
    throttles_pending: AtomicU32,
    throttle_retry_after_ms: AtomicU64,
    failures_pending: AtomicU32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            properties: DashMap::new(),
            overrides: DashMap::new(),
            wal: None,
            clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            mutations: AtomicU64::new(0),
            throttles_pending: AtomicU32::new(0),
            throttle_retry_after_ms: AtomicU64::new(0),
            failures_pending: AtomicU32::new(0),
        }
    }

    /// Open a durable store, replaying whatever the log already holds.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let events = Wal::replay(path)?;
        let mut store = Self::new();
        for event in &events {
            store.apply_event(event);
        }
        store.wal = Some(tokio::sync::Mutex::new(Wal::open(path)?));
        info!(
            "opened record store at {}: {} records, {} properties",
            path.display(),
            store.records.len(),
            store.properties.len()
        );
        Ok(store)
    }

    // ── Test hooks ───────────────────────────────────────────

    /// The next `n` mutations fail with `Throttled`.
    pub fn throttle_next(&self, n: u32, retry_after: Option<Duration>) {
        let ms = retry_after.map_or(0, |d| d.as_millis() as u64);
        self.throttle_retry_after_ms.store(ms, Ordering::SeqCst);
        self.throttles_pending.store(n, Ordering::SeqCst);
    }

    /// The next `n` mutations fail with a backend error.
    pub fn fail_next_batches(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Accepted mutation calls (create / batch_create / batch_update).
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Every row, oldest first.
    pub fn records(&self) -> Vec<PersistedRecord> {
        let mut all: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| (r.created_ts, r.id));
        all
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    // ── Seeding ──────────────────────────────────────────────

    pub async fn upsert_property(&self, property: Property) -> Result<(), StoreError> {
        if property.name.len() > MAX_PROPERTY_NAME_LEN {
            return Err(StoreError::LimitExceeded("property name too long"));
        }
        self.commit(vec![StoreEvent::PropertyUpserted(property)]).await
    }

    pub async fn upsert_guest_override(&self, rule: GuestOverride) -> Result<(), StoreError> {
        self.commit(vec![StoreEvent::GuestOverrideUpserted(rule)]).await
    }

    // ── Compaction ───────────────────────────────────────────

    pub async fn needs_compaction(&self, threshold: u64) -> bool {
        match &self.wal {
            Some(wal) => wal.lock().await.events_since_compact() >= threshold,
            None => false,
        }
    }

    /// Rewrite the log as a snapshot of current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else { return Ok(()) };
        let mut events: Vec<StoreEvent> = self
            .properties
            .iter()
            .map(|e| StoreEvent::PropertyUpserted(e.value().clone()))
            .collect();
        events.extend(
            self.overrides
                .iter()
                .map(|e| StoreEvent::GuestOverrideUpserted(e.value().clone())),
        );
        events.extend(self.records().into_iter().map(StoreEvent::RecordCreated));

        let mut guard = wal.lock().await;
        guard
            .compact(&events)
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        info!(
            "compacted {} to {} events",
            guard.path().display(),
            events.len()
        );
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────

    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = Utc::now();
        if now <= *last {
            now = *last + TimeDelta::microseconds(1);
        }
        *last = now;
        now
    }

    fn observe_stamp(&self, ts: DateTime<Utc>) {
        let mut last = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        if ts > *last {
            *last = ts;
        }
    }

    fn take_fault(&self) -> Result<(), StoreError> {
        let take = |counter: &AtomicU32| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        if take(&self.throttles_pending) {
            let ms = self.throttle_retry_after_ms.load(Ordering::SeqCst);
            return Err(StoreError::Throttled {
                retry_after: (ms > 0).then(|| Duration::from_millis(ms)),
            });
        }
        if take(&self.failures_pending) {
            return Err(StoreError::Backend("injected batch failure".into()));
        }
        Ok(())
    }

    /// Log first, then apply.
    async fn commit(&self, events: Vec<StoreEvent>) -> Result<(), StoreError> {
        if let Some(wal) = &self.wal {
            let mut guard = wal.lock().await;
            guard
                .append_batch(&events)
                .map_err(|e| StoreError::WalError(e.to_string()))?;
        }
        for event in &events {
            self.apply_event(event);
        }
        Ok(())
    }

    fn apply_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::RecordCreated(record) => {
                self.observe_stamp(record.last_updated_ts);
                self.records.insert(record.id, record.clone());
            }
            StoreEvent::RecordUpdated { update, at } => {
                self.observe_stamp(*at);
                if let Some(mut row) = self.records.get_mut(&update.id) {
                    if let Some(status) = update.lifecycle_status {
                        row.fields.lifecycle_status = status;
                    }
                    if let Some(ref carried) = update.carried_fields {
                        row.fields.carried_fields = carried.clone();
                    }
                    row.last_updated_ts = *at;
                }
            }
            StoreEvent::PropertyUpserted(property) => {
                self.properties.insert(property.id, property.clone());
            }
            StoreEvent::GuestOverrideUpserted(rule) => {
                self.overrides
                    .insert(rule.pattern.to_lowercase(), rule.clone());
            }
        }
    }

    fn build_created(&self, fields: RecordFields) -> PersistedRecord {
        let ts = self.stamp();
        PersistedRecord {
            id: Ulid::new(),
            created_ts: ts,
            last_updated_ts: ts,
            fields,
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>, StoreError> {
        let mut hits: Vec<PersistedRecord> = self
            .records
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|r| (r.created_ts, r.id));
        Ok(hits)
    }

    async fn create(&self, fields: RecordFields) -> Result<PersistedRecord, StoreError> {
        self.take_fault()?;
        let record = self.build_created(fields);
        self.commit(vec![StoreEvent::RecordCreated(record.clone())])
            .await?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn batch_create(
        &self,
        batch: Vec<RecordFields>,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        if batch.len() > MAX_BATCH_SIZE {
            return Err(StoreError::LimitExceeded("batch too large"));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.take_fault()?;
        let created: Vec<PersistedRecord> =
            batch.into_iter().map(|f| self.build_created(f)).collect();
        let events = created
            .iter()
            .cloned()
            .map(StoreEvent::RecordCreated)
            .collect();
        self.commit(events).await?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn batch_update(&self, batch: Vec<RecordUpdate>) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_SIZE {
            return Err(StoreError::LimitExceeded("batch too large"));
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.take_fault()?;
        // Whole batch is rejected if any id is unknown.
        if let Some(missing) = batch.iter().find(|u| !self.records.contains_key(&u.id)) {
            return Err(StoreError::NotFound(missing.id));
        }
        let events = batch
            .into_iter()
            .map(|update| StoreEvent::RecordUpdated {
                update,
                at: self.stamp(),
            })
            .collect();
        self.commit(events).await?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn properties(&self) -> Result<Vec<Property>, StoreError> {
        let mut all: Vec<Property> = self.properties.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn guest_overrides(&self) -> Result<Vec<GuestOverride>, StoreError> {
        let mut all: Vec<GuestOverride> =
            self.overrides.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        Ok(all)
    }
}
