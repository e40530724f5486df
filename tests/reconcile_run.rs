use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use staysync::config::{MatchStrategy, ReconcileSettings};
use staysync::engine::{Reconciler, RunInput, RunSummary};
use staysync::feed::{ParseOptions, PropertyIndex};
use staysync::flags::compute_flags;
use staysync::manifest::{self, FeedDescriptor, PropertySeed};
use staysync::model::*;
use staysync::store::{InMemoryStore, RecordStore};

// ── Test infrastructure ──────────────────────────────────────

const EVOLVE_V1: &str = "\u{feff}Reservation,Property,Check-In,Check-Out,Guest,Type,Status
R-1,Beach House,2026-06-01,2026-06-05,Jane Doe,Guest Stay,Confirmed
R-2,Lake Cabin #310,06/05/2026,06/08/2026,Ann Lee,Guest Stay,Confirmed
R-3,beach house,2026-06-05,2026-06-08,Bo Chen,Guest Stay,Confirmed
R-4,Unknown Villa,2026-07-10,2026-07-14,The Smith Family,Guest Stay,Confirmed
R-5,Beach House,2025-01-01,2025-01-04,Too Old,Guest Stay,Confirmed
";

// R-1 moves a day later, R-2 is cancelled.
const EVOLVE_V2: &str = "Reservation,Property,Check-In,Check-Out,Guest,Type,Status
R-1,Beach House,2026-06-02,2026-06-05,Jane Doe,Guest Stay,Confirmed
R-2,Lake Cabin #310,06/05/2026,06/08/2026,Ann Lee,Guest Stay,Cancelled
R-3,beach house,2026-06-05,2026-06-08,Bo Chen,Guest Stay,Confirmed
R-4,Unknown Villa,2026-07-10,2026-07-14,The Smith Family,Guest Stay,Confirmed
";

const EVOLVE_BROKEN: &str = "Reservation,Check-In\nR-1,2026-06-02\n";

fn calendar(event_uid: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\n\
PRODID:-//Airbnb Inc//Hosting Calendar 1.0//EN\r\n\
BEGIN:VEVENT\r\n\
DTSTART;VALUE=DATE:20260620\r\n\
DTEND;VALUE=DATE:20260625\r\n\
SUMMARY:Reserved\r\n\
UID:{event_uid}\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
DTSTART;VALUE=DATE:20260701\r\n\
DTEND;VALUE=DATE:20260703\r\n\
SUMMARY:Airbnb (Not available)\r\n\
UID:blk-1@airbnb.com\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n"
    )
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 5, 20).unwrap()
}

struct Fixture {
    dir: PathBuf,
    beach: PropertyId,
    lake: PropertyId,
}

impl Fixture {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("staysync_int_test_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            beach: Ulid::new(),
            lake: Ulid::new(),
        }
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join("records.wal")
    }

    fn seed(&self) -> PropertySeed {
        PropertySeed {
            properties: vec![
                Property {
                    id: self.beach,
                    name: "Beach House".into(),
                    listing_number: Some(202),
                },
                Property {
                    id: self.lake,
                    name: "Lake Cabin".into(),
                    listing_number: Some(310),
                },
            ],
            guest_overrides: vec![GuestOverride {
                pattern: "smith family".into(),
                property_id: self.lake,
            }],
        }
    }

    fn write_feeds(&self, evolve: &str, calendar: &str) -> Vec<FeedDescriptor> {
        std::fs::write(self.dir.join("evolve.csv"), evolve).unwrap();
        std::fs::write(self.dir.join("lake.ics"), calendar).unwrap();
        vec![
            FeedDescriptor {
                feed_identifier: "evolve".into(),
                path: self.dir.join("evolve.csv"),
                platform: None,
                url: None,
                property_name: None,
            },
            FeedDescriptor {
                feed_identifier: "airbnb-lake".into(),
                path: self.dir.join("lake.ics"),
                platform: None,
                url: Some("https://www.airbnb.com/calendar/ical/310.ics".into()),
                property_name: Some("Lake Cabin".into()),
            },
        ]
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn run_once(store: &Arc<InMemoryStore>, feeds: Vec<FeedDescriptor>) -> RunSummary {
    let index = Arc::new(PropertyIndex::build(
        &store.properties().await.unwrap(),
        &store.guest_overrides().await.unwrap(),
    ));
    let opts = ParseOptions {
        today: today(),
        lookback_days: 30,
        lookahead_days: 365,
    };
    let loaded = manifest::load_feeds(feeds, index, opts, 2).await;

    let mut input = RunInput::new(today());
    for (feed, entries) in loaded.parsed {
        input.add_feed(feed, entries);
    }
    compute_flags(&mut input.entries);

    let settings = ReconcileSettings {
        match_strategy: MatchStrategy::Hybrid,
        base_backoff: Duration::from_millis(1),
        ..ReconcileSettings::default()
    };
    Reconciler::new(store.clone(), settings)
        .run(input)
        .await
        .unwrap()
}

fn active(store: &InMemoryStore, feed: &str, uid: &str) -> Vec<PersistedRecord> {
    store
        .records()
        .into_iter()
        .filter(|r| r.is_active() && r.fields.feed_identifier == feed && r.fields.entity_uid == uid)
        .collect()
}

fn active_count(store: &InMemoryStore) -> usize {
    store.records().iter().filter(|r| r.is_active()).count()
}

fn open(path: &Path) -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::open(path).unwrap())
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_across_runs_and_restart() {
    let fx = Fixture::new();
    let store = open(&fx.wal_path());
    manifest::apply_seed(&store, fx.seed()).await.unwrap();

    // First sighting: everything in the window is New. R-5 is outside it.
    let first = run_once(&store, fx.write_feeds(EVOLVE_V1, &calendar("evt-1@airbnb.com"))).await;
    assert_eq!(first.new, 6);
    assert_eq!(store.record_count(), 6);

    let r1 = active(&store, "evolve", "R-1").remove(0);
    assert_eq!(r1.fields.property_ref, Some(fx.beach));
    assert!(r1.fields.same_day_turnover);
    assert!(!r1.fields.overlapping);
    let r2 = active(&store, "evolve", "R-2").remove(0);
    assert_eq!(r2.fields.property_ref, Some(fx.lake));
    let r4 = active(&store, "evolve", "R-4").remove(0);
    assert_eq!(r4.fields.property_ref, Some(fx.lake));
    let block = active(&store, "airbnb-lake", "blk-1@airbnb.com").remove(0);
    assert_eq!(block.fields.entry_kind, EntryKind::Block);
    assert_eq!(block.fields.source_platform, Platform::Airbnb);

    // Downstream attaches a job to R-1.
    let mut carried = CarriedFields::new();
    carried.insert("service_job_id".into(), "job_1001".into());
    store
        .batch_update(vec![RecordUpdate {
            id: r1.id,
            lifecycle_status: None,
            carried_fields: Some(carried),
        }])
        .await
        .unwrap();

    // Identical replay writes nothing.
    let mutations = store.mutation_count();
    let replay = run_once(&store, fx.write_feeds(EVOLVE_V1, &calendar("evt-1@airbnb.com"))).await;
    assert_eq!(replay.unchanged, 6);
    assert!(replay.is_noop());
    assert_eq!(store.mutation_count(), mutations);

    // Date change, cancellation and a reissued calendar uid.
    let third = run_once(
        &store,
        fx.write_feeds(EVOLVE_V2, &calendar("evt-1-reissued@airbnb.com")),
    )
    .await;
    assert_eq!(third.new, 0);
    assert_eq!(third.modified, 2);
    assert_eq!(third.unchanged, 3);
    assert_eq!(third.removed, 1);

    let r1_now = active(&store, "evolve", "R-1").remove(0);
    assert_eq!(r1_now.status(), LifecycleStatus::Modified);
    assert_eq!(
        r1_now.fields.span,
        DateSpan::new(
            NaiveDate::from_ymd_opt(2026, 6, 2).unwrap(),
            NaiveDate::from_ymd_opt(2026, 6, 5).unwrap()
        )
    );
    assert_eq!(r1_now.fields.carried_fields["service_job_id"], "job_1001");
    assert!(active(&store, "evolve", "R-2").is_empty());
    let event = active(&store, "airbnb-lake", "evt-1@airbnb.com").remove(0);
    assert_eq!(event.fields.upstream_uid, "evt-1-reissued@airbnb.com");
    assert!(active(&store, "airbnb-lake", "evt-1-reissued@airbnb.com").is_empty());

    let records_before_restart = store.records();
    drop(store);

    // Restart: state comes back from the log.
    let store = open(&fx.wal_path());
    assert_eq!(store.records(), records_before_restart);
    assert_eq!(store.properties().await.unwrap().len(), 2);

    // A broken spreadsheet fails alone and retires nothing.
    let fourth = run_once(
        &store,
        fx.write_feeds(EVOLVE_BROKEN, &calendar("evt-1-reissued@airbnb.com")),
    )
    .await;
    assert_eq!(fourth.unchanged, 2);
    assert_eq!(fourth.removed, 0);
    assert_eq!(active_count(&store), 5);
    assert!(fx.dir.join("evolve.csv").exists());
}

#[tokio::test]
async fn compaction_keeps_the_reconciled_state() {
    let fx = Fixture::new();
    let store = open(&fx.wal_path());
    manifest::apply_seed(&store, fx.seed()).await.unwrap();
    run_once(&store, fx.write_feeds(EVOLVE_V1, &calendar("evt-1@airbnb.com"))).await;
    run_once(&store, fx.write_feeds(EVOLVE_V2, &calendar("evt-2@airbnb.com"))).await;

    assert!(store.needs_compaction(1).await);
    store.compact().await.unwrap();
    let before = store.records();
    drop(store);

    let store = open(&fx.wal_path());
    assert_eq!(store.records(), before);
    let summary = run_once(&store, fx.write_feeds(EVOLVE_V2, &calendar("evt-2@airbnb.com"))).await;
    assert!(summary.is_noop());
}
