//! Reconciler: folds one run's entries into the record store.
//!
//! Per entry: session duplicate check, primary match on
//! `(entity_uid, feed_identifier)` (or on the uid a churned record was last
//! reported under), optional hybrid match on the slot within
//! the same feed, then either Unchanged, a Modified successor, a store-level
//! duplicate, or a New record. Afterwards the removal scan retires whatever
//! the run's feeds no longer report.
//!
//! Writes are batched, so reads made later in the same run may not see
//! them yet. The run compensates by remembering which entities and slots it
//! has already handled and never matching against those again.

mod error;
mod history;
mod removal;
mod tracker;

pub use error::ReconcileError;
pub use history::{ClonePlan, FieldDelta, RETRACTED_PREFIX, clone_forward};
pub use tracker::SessionTracker;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::config::{MatchStrategy, ReconcileSettings};
use crate::model::*;
use crate::store::{BatchWriter, RecordFilter, RecordStore, StoreError, retry_throttled};

/// Classification of one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    New,
    Modified,
    Unchanged,
    DuplicateIgnored,
}

/// Everything one run reconciles.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub today: NaiveDate,
    /// Feeds that parsed successfully. Only these are scanned for removals.
    pub feeds: BTreeSet<String>,
    pub entries: Vec<Entry>,
}

impl RunInput {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            feeds: BTreeSet::new(),
            entries: Vec::new(),
        }
    }

    /// Register a parsed feed. A feed with no entries still counts: its
    /// records are all candidates for removal.
    pub fn add_feed(&mut self, feed_identifier: impl Into<String>, entries: impl IntoIterator<Item = Entry>) {
        self.feeds.insert(feed_identifier.into());
        self.entries.extend(entries);
    }
}

/// Tallies for one run, returned by `Reconciler::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub removed: usize,
    /// Absent records kept because they already ended.
    pub kept_past: usize,
    /// Absent records kept because their slot was seen under another uid.
    pub kept_reappeared: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub failed_batches: usize,
    /// Outcome of every entry, in input order.
    pub outcomes: Vec<(EntityKey, Outcome)>,
}

impl RunSummary {
    fn record(&mut self, key: EntityKey, outcome: Outcome) {
        match outcome {
            Outcome::New => self.new += 1,
            Outcome::Modified => self.modified += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::DuplicateIgnored => self.duplicates += 1,
        }
        metrics::counter!(
            crate::observability::ENTRIES_TOTAL,
            "outcome" => crate::observability::outcome_label(&outcome)
        )
        .increment(1);
        self.outcomes.push((key, outcome));
    }

    pub fn outcome_of(&self, key: &EntityKey) -> Option<Outcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| *outcome)
    }

    /// True when the run wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.new == 0 && self.modified == 0 && self.removed == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "new={} modified={} unchanged={} duplicate={} removed={} kept_past={} kept_reappeared={} failed_batches={}",
            self.new,
            self.modified,
            self.unchanged,
            self.duplicates,
            self.removed,
            self.kept_past,
            self.kept_reappeared,
            self.failed_batches
        )
    }
}

/// State that lives for exactly one run.
struct RunState<S: RecordStore + ?Sized> {
    writer: BatchWriter<S>,
    /// Entity keys reported by this run's feeds.
    incoming: HashSet<EntityKey>,
    /// Entity keys classified this run, including hybrid-bound ones.
    touched: HashSet<EntityKey>,
    /// Slots seen this run, duplicates included.
    seen_slots: HashSet<SlotKey>,
    summary: RunSummary,
}

pub struct Reconciler<S: RecordStore + ?Sized> {
    store: Arc<S>,
    settings: ReconcileSettings,
    tracker: SessionTracker,
}

impl<S: RecordStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            settings,
            tracker: SessionTracker::new(),
        }
    }

    /// Reconcile one run. Entries should already carry their flags.
    ///
    /// Returns an error only when the store stays throttled past the retry
    /// ceiling or a read fails; writes queued after that point are dropped.
    pub async fn run(&mut self, input: RunInput) -> Result<RunSummary, ReconcileError> {
        let started = Instant::now();
        self.tracker.clear();
        let mut run = RunState {
            writer: BatchWriter::new(
                self.store.clone(),
                self.settings.batch_size,
                self.settings.max_retries,
                self.settings.base_backoff,
            ),
            incoming: input.entries.iter().map(Entry::entity_key).collect(),
            touched: HashSet::new(),
            seen_slots: HashSet::new(),
            summary: RunSummary::default(),
        };

        for entry in &input.entries {
            let outcome = self.reconcile_entry(&mut run, entry).await?;
            debug!(
                "{} in '{}' {}: {:?}",
                entry.entity_uid, entry.feed_identifier, entry.span, outcome
            );
            run.summary.record(entry.entity_key(), outcome);
        }

        // Removal reads the store; everything classified so far must be visible.
        run.writer.flush().await?;
        self.scan_removals(&mut run, &input.feeds, input.today).await?;
        run.writer.flush().await?;

        let stats = run.writer.stats();
        let mut summary = run.summary;
        summary.records_created = stats.created;
        summary.records_updated = stats.updated;
        summary.failed_batches = stats.failed_batches;

        metrics::histogram!(crate::observability::RUN_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!("reconciliation finished: {summary}");
        Ok(summary)
    }

    async fn reconcile_entry(
        &mut self,
        run: &mut RunState<S>,
        entry: &Entry,
    ) -> Result<Outcome, ReconcileError> {
        let slot = entry.slot_key();
        let key = entry.entity_key();

        if self.tracker.contains(&slot) || run.touched.contains(&key) {
            run.seen_slots.insert(slot);
            return Ok(Outcome::DuplicateIgnored);
        }

        let mut matched = self.primary_match(run, &key).await?;
        if matched.is_none() && self.settings.match_strategy == MatchStrategy::Hybrid {
            matched = self.hybrid_match(run, entry).await?;
            if let Some(ref record) = matched {
                debug!(
                    "'{}' bound to existing entity '{}' by slot {}",
                    entry.entity_uid, record.fields.entity_uid, slot.span
                );
            }
        }

        if let Some(current) = matched {
            let bound = current.fields.entity_key();
            self.tracker.insert(slot);
            run.seen_slots.insert(slot);
            run.touched.insert(key);
            run.touched.insert(bound.clone());

            let delta = FieldDelta::between(&current.fields, entry);
            if delta.is_empty() {
                return Ok(Outcome::Unchanged);
            }
            debug!("{} changed: {}", bound.entity_uid, delta.changed_fields().join(", "));
            let siblings = self.query(RecordFilter::entity(&bound)).await?;
            let Some(plan) = clone_forward(
                &siblings,
                &delta,
                LifecycleStatus::Modified,
                &self.settings.job_link_field,
            ) else {
                warn!("entity '{}' vanished from the store mid-run", bound.entity_uid);
                return Ok(Outcome::Unchanged);
            };
            queue_plan(run, plan).await?;
            return Ok(Outcome::Modified);
        }

        // Another active record already holds this slot under a different uid.
        let holders = self.query(RecordFilter::slot(slot).active()).await?;
        if let Some(holder) = holders
            .iter()
            .find(|r| !run.touched.contains(&r.fields.entity_key()))
        {
            debug!(
                "'{}' duplicates active record '{}' in '{}'",
                entry.entity_uid, holder.fields.entity_uid, holder.fields.feed_identifier
            );
            run.seen_slots.insert(slot);
            return Ok(Outcome::DuplicateIgnored);
        }

        self.tracker.insert(slot);
        run.seen_slots.insert(slot);
        run.touched.insert(key);
        run.writer
            .push_create(RecordFields::from_entry(entry, LifecycleStatus::New))
            .await?;
        Ok(Outcome::New)
    }

    /// Active record of the entity, or failing that one whose identifier
    /// churned to this uid on an earlier run.
    async fn primary_match(
        &self,
        run: &RunState<S>,
        key: &EntityKey,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        let active = self.query(RecordFilter::entity(key).active()).await?;
        if active.len() > 1 {
            warn!(
                "entity '{}' in '{}' has {} active records",
                key.entity_uid,
                key.feed_identifier,
                active.len()
            );
        }
        if !active.is_empty() {
            return Ok(latest(active));
        }
        let renamed = self.query(RecordFilter::upstream(key).active()).await?;
        Ok(latest(renamed.into_iter().filter(|r| {
            let bound = r.fields.entity_key();
            !run.touched.contains(&bound) && !run.incoming.contains(&bound)
        })))
    }

    /// Active record in the same feed holding the entry's slot, unless its
    /// entity was already handled this run or is still reported under its own uid.
    async fn hybrid_match(
        &self,
        run: &RunState<S>,
        entry: &Entry,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        let filter = RecordFilter::slot(entry.slot_key())
            .in_feed(&entry.feed_identifier)
            .active();
        let candidates = self.query(filter).await?.into_iter().filter(|r| {
            let key = r.fields.entity_key();
            !run.touched.contains(&key) && !run.incoming.contains(&key)
        });
        Ok(latest(candidates))
    }

    async fn query(&self, filter: RecordFilter) -> Result<Vec<PersistedRecord>, StoreError> {
        let store = self.store.clone();
        retry_throttled(self.settings.max_retries, self.settings.base_backoff, || {
            let store = store.clone();
            let filter = filter.clone();
            async move { store.query(&filter).await }
        })
        .await
    }
}

/// Retirements first, then the successor, which is only written if they land.
async fn queue_plan<S: RecordStore + ?Sized>(
    run: &mut RunState<S>,
    plan: ClonePlan,
) -> Result<(), StoreError> {
    let retired: Vec<RecordId> = plan.retire.iter().map(|u| u.id).collect();
    for update in plan.retire {
        run.writer.push_update(update).await?;
    }
    run.writer.push_successor(plan.successor, retired).await
}

fn latest(records: impl IntoIterator<Item = PersistedRecord>) -> Option<PersistedRecord> {
    records
        .into_iter()
        .max_by_key(|r| (r.last_updated_ts, r.created_ts, r.id))
}
