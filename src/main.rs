use std::sync::Arc;

use tracing::info;

use staysync::config::Settings;
use staysync::engine::{Reconciler, RunInput};
use staysync::feed::{ParseOptions, PropertyIndex};
use staysync::flags::compute_flags;
use staysync::manifest;
use staysync::store::{InMemoryStore, RecordStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    staysync::observability::init(settings.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&settings.data_dir)?;

    let store = Arc::new(InMemoryStore::open(&settings.wal_path())?);
    if let Some(seed) = manifest::load_property_seed(&settings.properties_path())? {
        manifest::apply_seed(&store, seed).await?;
    }

    // Lookup tables are a snapshot for the whole run.
    let index = Arc::new(PropertyIndex::build(
        &store.properties().await?,
        &store.guest_overrides().await?,
    ));

    let today = chrono::Local::now().date_naive();
    let opts = ParseOptions {
        today,
        lookback_days: settings.lookback_days,
        lookahead_days: settings.lookahead_days,
    };
    info!("staysync run for {today}");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  feeds: {}", settings.feed_manifest.display());
    info!("  properties: {}", index.len());
    info!("  match strategy: {:?}", settings.reconcile.match_strategy);
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let feeds = manifest::load_manifest(&settings.feed_manifest)?;
    let loaded = manifest::load_feeds(feeds, index, opts, settings.max_parallel_feeds).await;

    let mut input = RunInput::new(today);
    for (feed, entries) in loaded.parsed {
        input.add_feed(feed, entries);
    }
    compute_flags(&mut input.entries);

    let mut reconciler = Reconciler::new(store.clone(), settings.reconcile.clone());
    let summary = reconciler.run(input).await?;

    if store.needs_compaction(settings.compact_threshold).await {
        store.compact().await?;
    }

    info!(
        "done: {summary}; {} feed(s) failed",
        loaded.failed.len()
    );
    Ok(())
}
