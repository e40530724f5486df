mod batch;
mod error;
mod memory;

pub use batch::{BatchWriter, FlushStats, retry_throttled};
pub use error::StoreError;
pub use memory::InMemoryStore;

use async_trait::async_trait;

use crate::model::*;

/// Conjunctive filter over persisted records. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub entity_uid: Option<String>,
    pub upstream_uid: Option<String>,
    pub feed_identifier: Option<String>,
    pub slot: Option<SlotKey>,
    pub active_only: bool,
}

impl RecordFilter {
    /// Every row of one entity's chain, any status.
    pub fn entity(key: &EntityKey) -> Self {
        Self {
            entity_uid: Some(key.entity_uid.clone()),
            feed_identifier: Some(key.feed_identifier.clone()),
            ..Self::default()
        }
    }

    /// Rows in one feed whose last reported identifier is `key.entity_uid`.
    pub fn upstream(key: &EntityKey) -> Self {
        Self {
            upstream_uid: Some(key.entity_uid.clone()),
            feed_identifier: Some(key.feed_identifier.clone()),
            ..Self::default()
        }
    }

    pub fn slot(slot: SlotKey) -> Self {
        Self {
            slot: Some(slot),
            ..Self::default()
        }
    }

    pub fn feed(feed_identifier: &str) -> Self {
        Self {
            feed_identifier: Some(feed_identifier.to_string()),
            ..Self::default()
        }
    }

    pub fn in_feed(mut self, feed_identifier: &str) -> Self {
        self.feed_identifier = Some(feed_identifier.to_string());
        self
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, record: &PersistedRecord) -> bool {
        let f = &record.fields;
        if self.active_only && !f.lifecycle_status.is_active() {
            return false;
        }
        if let Some(ref uid) = self.entity_uid
            && uid != &f.entity_uid
        {
            return false;
        }
        if let Some(ref uid) = self.upstream_uid
            && uid != &f.upstream_uid
        {
            return false;
        }
        if let Some(ref feed) = self.feed_identifier
            && feed != &f.feed_identifier
        {
            return false;
        }
        if let Some(slot) = self.slot
            && slot != f.slot_key()
        {
            return false;
        }
        true
    }
}

/// The external tabular store. No transactions; a write is visible to later
/// reads of the same client but other writers may race.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>, StoreError>;

    async fn create(&self, fields: RecordFields) -> Result<PersistedRecord, StoreError>;

    async fn batch_create(
        &self,
        batch: Vec<RecordFields>,
    ) -> Result<Vec<PersistedRecord>, StoreError>;

    async fn batch_update(&self, batch: Vec<RecordUpdate>) -> Result<(), StoreError>;

    /// Property name/listing table, read once per run.
    async fn properties(&self) -> Result<Vec<Property>, StoreError>;

    /// Guest-pattern override table, read once per run.
    async fn guest_overrides(&self) -> Result<Vec<GuestOverride>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use ulid::Ulid;

    fn record(uid: &str, feed: &str, status: LifecycleStatus) -> PersistedRecord {
        let start = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 6, 5).unwrap();
        PersistedRecord {
            id: Ulid::new(),
            created_ts: Utc::now(),
            last_updated_ts: Utc::now(),
            fields: RecordFields {
                entity_uid: uid.into(),
                upstream_uid: uid.into(),
                feed_identifier: feed.into(),
                property_ref: None,
                span: DateSpan::new(start, end),
                entry_kind: EntryKind::Reservation,
                service_kind: ServiceKind::Turnover,
                source_platform: Platform::Generic,
                overlapping: false,
                same_day_turnover: false,
                upstream_same_day_override: None,
                metadata: Metadata::new(),
                lifecycle_status: status,
                carried_fields: CarriedFields::new(),
            },
        }
    }

    #[test]
    fn entity_filter_scopes_by_feed() {
        let r = record("A", "feed-1", LifecycleStatus::Old);
        let key = EntityKey {
            entity_uid: "A".into(),
            feed_identifier: "feed-1".into(),
        };
        assert!(RecordFilter::entity(&key).matches(&r));
        assert!(!RecordFilter::entity(&key).active().matches(&r));
        let other_feed = EntityKey {
            entity_uid: "A".into(),
            feed_identifier: "feed-2".into(),
        };
        assert!(!RecordFilter::entity(&other_feed).matches(&r));
    }

    #[test]
    fn slot_filter_compares_kind() {
        let r = record("A", "feed-1", LifecycleStatus::New);
        let mut slot = r.fields.slot_key();
        assert!(RecordFilter::slot(slot).active().in_feed("feed-1").matches(&r));
        slot.entry_kind = EntryKind::Block;
        assert!(!RecordFilter::slot(slot).matches(&r));
    }

    #[test]
    fn upstream_filter_follows_the_reported_uid() {
        let mut r = record("U1", "feed-1", LifecycleStatus::Modified);
        r.fields.upstream_uid = "U2".into();
        let reported = EntityKey {
            entity_uid: "U2".into(),
            feed_identifier: "feed-1".into(),
        };
        assert!(RecordFilter::upstream(&reported).active().matches(&r));
        assert!(!RecordFilter::entity(&reported).matches(&r));
        let elsewhere = EntityKey {
            feed_identifier: "feed-2".into(),
            ..reported
        };
        assert!(!RecordFilter::upstream(&elsewhere).matches(&r));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(RecordFilter::default().matches(&record("A", "f", LifecycleStatus::Removed)));
    }
}
