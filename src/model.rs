use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier the record store assigns to a row.
pub type RecordId = Ulid;

/// Identifier of a managed property in the record store.
pub type PropertyId = Ulid;

/// Values owned by the downstream scheduling integration. Never interpreted here.
pub type CarriedFields = BTreeMap<String, String>;

/// Free-form feed metadata (guest name, notes, raw status, ...).
pub type Metadata = BTreeMap<String, String>;

/// Half-open date interval `[start, end)`. `end` is the checkout day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateSpan start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// A checkout on another stay's check-in day is not an overlap.
    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryKind {
    Reservation,
    Block,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Reservation => "reservation",
            EntryKind::Block => "block",
        }
    }
}

/// What the downstream crew is scheduled to do for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Turnover,
    ReturnLaundry,
    Inspection,
    OwnerArrival,
    Maintenance,
    NeedsReview,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Turnover => "turnover",
            ServiceKind::ReturnLaundry => "return_laundry",
            ServiceKind::Inspection => "inspection",
            ServiceKind::OwnerArrival => "owner_arrival",
            ServiceKind::Maintenance => "maintenance",
            ServiceKind::NeedsReview => "needs_review",
        }
    }
}

/// Where a feed came from. The first two are spreadsheet exports, the rest calendars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Evolve,
    ITrip,
    Airbnb,
    Vrbo,
    BookingCom,
    Hospitable,
    Generic,
}

impl Platform {
    pub fn is_tabular(&self) -> bool {
        matches!(self, Platform::Evolve | Platform::ITrip)
    }

    pub const ALL: [Platform; 7] = [
        Platform::Evolve,
        Platform::ITrip,
        Platform::Airbnb,
        Platform::Vrbo,
        Platform::BookingCom,
        Platform::Hospitable,
        Platform::Generic,
    ];

    /// Inverse of `as_str`, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|p| p.as_str().eq_ignore_ascii_case(s))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Evolve => "evolve",
            Platform::ITrip => "itrip",
            Platform::Airbnb => "airbnb",
            Platform::Vrbo => "vrbo",
            Platform::BookingCom => "booking_com",
            Platform::Hospitable => "hospitable",
            Platform::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleStatus {
    New,
    Modified,
    Old,
    Removed,
}

impl LifecycleStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleStatus::New | LifecycleStatus::Modified)
    }
}

/// `(entity_uid, feed_identifier)`: uids are only unique within one feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_uid: String,
    pub feed_identifier: String,
}

/// The logical calendar slot an entry occupies. Two entries with the same slot
/// describe the same real-world booking regardless of their uids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub property_ref: Option<PropertyId>,
    pub span: DateSpan,
    pub entry_kind: EntryKind,
}

/// One sighting of a booking or block in a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entity_uid: String,
    pub feed_identifier: String,
    pub property_ref: Option<PropertyId>,
    pub span: DateSpan,
    pub entry_kind: EntryKind,
    pub service_kind: ServiceKind,
    pub source_platform: Platform,
    pub overlapping: bool,
    pub same_day_turnover: bool,
    /// When present, replaces the computed `same_day_turnover`.
    pub upstream_same_day_override: Option<bool>,
    pub metadata: Metadata,
}

impl Entry {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            property_ref: self.property_ref,
            span: self.span,
            entry_kind: self.entry_kind,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity_uid: self.entity_uid.clone(),
            feed_identifier: self.feed_identifier.clone(),
        }
    }
}

/// Writable columns of a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub entity_uid: String,
    /// Identifier the feed last reported; differs from `entity_uid` after a hybrid match.
    pub upstream_uid: String,
    pub feed_identifier: String,
    pub property_ref: Option<PropertyId>,
    pub span: DateSpan,
    pub entry_kind: EntryKind,
    pub service_kind: ServiceKind,
    pub source_platform: Platform,
    pub overlapping: bool,
    pub same_day_turnover: bool,
    pub upstream_same_day_override: Option<bool>,
    pub metadata: Metadata,
    pub lifecycle_status: LifecycleStatus,
    pub carried_fields: CarriedFields,
}

impl RecordFields {
    pub fn from_entry(entry: &Entry, lifecycle_status: LifecycleStatus) -> Self {
        Self {
            entity_uid: entry.entity_uid.clone(),
            upstream_uid: entry.entity_uid.clone(),
            feed_identifier: entry.feed_identifier.clone(),
            property_ref: entry.property_ref,
            span: entry.span,
            entry_kind: entry.entry_kind,
            service_kind: entry.service_kind,
            source_platform: entry.source_platform,
            overlapping: entry.overlapping,
            same_day_turnover: entry.same_day_turnover,
            upstream_same_day_override: entry.upstream_same_day_override,
            metadata: entry.metadata.clone(),
            lifecycle_status,
            carried_fields: CarriedFields::new(),
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            property_ref: self.property_ref,
            span: self.span,
            entry_kind: self.entry_kind,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity_uid: self.entity_uid.clone(),
            feed_identifier: self.feed_identifier.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: RecordId,
    pub created_ts: DateTime<Utc>,
    pub last_updated_ts: DateTime<Utc>,
    pub fields: RecordFields,
}

impl PersistedRecord {
    pub fn is_active(&self) -> bool {
        self.fields.lifecycle_status.is_active()
    }

    pub fn status(&self) -> LifecycleStatus {
        self.fields.lifecycle_status
    }
}

/// Partial update applied by `batch_update`. `None` leaves a column untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: RecordId,
    pub lifecycle_status: Option<LifecycleStatus>,
    pub carried_fields: Option<CarriedFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    /// Numeric listing code, as in `"Beach House #202"`.
    pub listing_number: Option<u32>,
}

/// Routes entries whose guest text contains `pattern` to a fixed property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestOverride {
    pub pattern: String,
    pub property_id: PropertyId,
}

/// The store's log record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    RecordCreated(PersistedRecord),
    RecordUpdated {
        update: RecordUpdate,
        at: DateTime<Utc>,
    },
    PropertyUpserted(Property),
    GuestOverrideUpserted(GuestOverride),
}
