//! History Cloner: records are never edited in place. A change retires every
//! active row of the entity as `Old` and appends a successor.

use crate::model::*;

/// Prefix written in front of a retired row's job link so downstream
/// callbacks carrying the old value no longer resolve to a live record.
pub const RETRACTED_PREFIX: &str = "retracted:";

/// Metadata describing one particular sighting. Not carried to a successor.
const NON_COPYABLE_METADATA: &[&str] = &["status"];

/// Field changes between a persisted record and a fresh sighting.
///
/// The first seven fields are the change-bearing ones. `metadata`,
/// `source_platform` and `upstream_same_day_override` are refreshed along
/// with a change but never count as one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDelta {
    pub property_ref: Option<Option<PropertyId>>,
    pub span: Option<DateSpan>,
    pub entry_kind: Option<EntryKind>,
    pub service_kind: Option<ServiceKind>,
    pub overlapping: Option<bool>,
    pub same_day_turnover: Option<bool>,
    pub upstream_uid: Option<String>,
    pub metadata: Option<Metadata>,
    pub source_platform: Option<Platform>,
    pub upstream_same_day_override: Option<Option<bool>>,
}

impl FieldDelta {
    pub fn between(current: &RecordFields, entry: &Entry) -> Self {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }
        Self {
            property_ref: changed(&current.property_ref, &entry.property_ref),
            span: changed(&current.span, &entry.span),
            entry_kind: changed(&current.entry_kind, &entry.entry_kind),
            service_kind: changed(&current.service_kind, &entry.service_kind),
            overlapping: changed(&current.overlapping, &entry.overlapping),
            same_day_turnover: changed(&current.same_day_turnover, &entry.same_day_turnover),
            upstream_uid: changed(&current.upstream_uid, &entry.entity_uid),
            metadata: Some(entry.metadata.clone()),
            source_platform: Some(entry.source_platform),
            upstream_same_day_override: Some(entry.upstream_same_day_override),
        }
    }

    /// Names of the change-bearing fields that differ.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.property_ref.is_some() {
            names.push("property_ref");
        }
        if self.span.is_some() {
            names.push("dates");
        }
        if self.entry_kind.is_some() {
            names.push("entry_kind");
        }
        if self.service_kind.is_some() {
            names.push("service_kind");
        }
        if self.overlapping.is_some() {
            names.push("overlapping");
        }
        if self.same_day_turnover.is_some() {
            names.push("same_day_turnover");
        }
        if self.upstream_uid.is_some() {
            names.push("upstream_uid");
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
    }

    fn apply(&self, fields: &mut RecordFields) {
        if let Some(property) = self.property_ref {
            fields.property_ref = property;
        }
        if let Some(span) = self.span {
            fields.span = span;
        }
        if let Some(kind) = self.entry_kind {
            fields.entry_kind = kind;
        }
        if let Some(service) = self.service_kind {
            fields.service_kind = service;
        }
        if let Some(flag) = self.overlapping {
            fields.overlapping = flag;
        }
        if let Some(flag) = self.same_day_turnover {
            fields.same_day_turnover = flag;
        }
        if let Some(ref uid) = self.upstream_uid {
            fields.upstream_uid = uid.clone();
        }
        if let Some(ref metadata) = self.metadata {
            fields.metadata = metadata.clone();
        }
        if let Some(platform) = self.source_platform {
            fields.source_platform = platform;
        }
        if let Some(forced) = self.upstream_same_day_override {
            fields.upstream_same_day_override = forced;
        }
    }
}

/// Writes that move an entity one step along its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonePlan {
    /// Retirements; must land before `successor` is created.
    pub retire: Vec<RecordUpdate>,
    pub successor: RecordFields,
}

/// Build the retirement updates and successor for an entity.
///
/// `siblings` is every persisted row of the entity, any status. Returns
/// `None` when there is nothing to clone from.
pub fn clone_forward(
    siblings: &[PersistedRecord],
    delta: &FieldDelta,
    target: LifecycleStatus,
    job_link_field: &str,
) -> Option<ClonePlan> {
    let template = pick_template(siblings)?;

    let retire = siblings
        .iter()
        .filter_map(|sibling| retirement(sibling, job_link_field))
        .collect();

    // Carried values come from the template as it was, before retraction.
    let mut successor = template.fields.clone();
    successor.lifecycle_status = target;
    if target == LifecycleStatus::Removed {
        successor.carried_fields.remove(job_link_field);
    }
    for key in NON_COPYABLE_METADATA {
        successor.metadata.remove(*key);
    }
    delta.apply(&mut successor);

    Some(ClonePlan { retire, successor })
}

/// Latest active row, else the latest row of any status.
fn pick_template(siblings: &[PersistedRecord]) -> Option<&PersistedRecord> {
    let recency = |r: &&PersistedRecord| (r.last_updated_ts, r.created_ts, r.id);
    siblings
        .iter()
        .filter(|r| r.is_active())
        .max_by_key(recency)
        .or_else(|| siblings.iter().max_by_key(recency))
}

/// Active rows become `Old`. Any row still holding a live job link gets it
/// retracted. `Old` and `Removed` rows are otherwise left alone.
fn retirement(sibling: &PersistedRecord, job_link_field: &str) -> Option<RecordUpdate> {
    let lifecycle_status = sibling.is_active().then_some(LifecycleStatus::Old);
    let carried_fields = match sibling.fields.carried_fields.get(job_link_field) {
        Some(link) if !link.is_empty() && !link.starts_with(RETRACTED_PREFIX) => {
            let mut carried = sibling.fields.carried_fields.clone();
            carried.insert(job_link_field.to_string(), format!("{RETRACTED_PREFIX}{link}"));
            Some(carried)
        }
        _ => None,
    };
    if lifecycle_status.is_none() && carried_fields.is_none() {
        return None;
    }
    Some(RecordUpdate {
        id: sibling.id,
        lifecycle_status,
        carried_fields,
    })
}
