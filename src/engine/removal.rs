//! Removal Scanner: retires active records the run's feeds stopped reporting.

use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::model::*;
use crate::store::{RecordFilter, RecordStore};

use super::{FieldDelta, ReconcileError, Reconciler, RunState, clone_forward, queue_plan};

/// Why an absent record stays active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// Classified this run; not absent at all.
    Touched,
    /// Already checked out.
    Past,
    /// Its slot was claimed this run by an entry under another uid.
    Reappeared,
}

impl Keep {
    fn as_str(&self) -> &'static str {
        match self {
            Keep::Touched => "touched",
            Keep::Past => "past",
            Keep::Reappeared => "reappeared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalDecision {
    Keep(Keep),
    Remove,
}

pub fn removal_decision(
    record: &PersistedRecord,
    today: NaiveDate,
    touched: &HashSet<EntityKey>,
    seen_slots: &HashSet<SlotKey>,
) -> RemovalDecision {
    if touched.contains(&record.fields.entity_key()) {
        RemovalDecision::Keep(Keep::Touched)
    } else if record.fields.span.end < today {
        RemovalDecision::Keep(Keep::Past)
    } else if seen_slots.contains(&record.fields.slot_key()) {
        RemovalDecision::Keep(Keep::Reappeared)
    } else {
        RemovalDecision::Remove
    }
}

impl<S: RecordStore + ?Sized> Reconciler<S> {
    /// Only feeds that parsed this run are scanned; a failed feed keeps
    /// every record it had.
    pub(super) async fn scan_removals(
        &mut self,
        run: &mut RunState<S>,
        feeds: &BTreeSet<String>,
        today: NaiveDate,
    ) -> Result<(), ReconcileError> {
        for feed in feeds {
            let active = self.query(RecordFilter::feed(feed).active()).await?;
            let mut handled: HashSet<EntityKey> = HashSet::new();
            for record in active {
                let key = record.fields.entity_key();
                if !handled.insert(key.clone()) {
                    continue;
                }
                match removal_decision(&record, today, &run.touched, &run.seen_slots) {
                    RemovalDecision::Keep(Keep::Touched) => {}
                    RemovalDecision::Keep(reason) => {
                        debug!(
                            "keeping absent '{}' in '{feed}' {}: {}",
                            key.entity_uid,
                            record.fields.span,
                            reason.as_str()
                        );
                        match reason {
                            Keep::Past => run.summary.kept_past += 1,
                            _ => run.summary.kept_reappeared += 1,
                        }
                        metrics::counter!(
                            crate::observability::REMOVAL_SKIPPED_TOTAL,
                            "reason" => reason.as_str()
                        )
                        .increment(1);
                    }
                    RemovalDecision::Remove => {
                        let siblings = self.query(RecordFilter::entity(&key)).await?;
                        let Some(plan) = clone_forward(
                            &siblings,
                            &FieldDelta::default(),
                            LifecycleStatus::Removed,
                            &self.settings.job_link_field,
                        ) else {
                            continue;
                        };
                        info!(
                            "removing '{}' in '{feed}' {}: no longer reported",
                            key.entity_uid, record.fields.span
                        );
                        queue_plan(run, plan).await?;
                        run.summary.removed += 1;
                        metrics::counter!(crate::observability::REMOVED_TOTAL).increment(1);
                    }
                }
            }
        }
        Ok(())
    }
}
