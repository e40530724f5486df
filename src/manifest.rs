//! Feed manifest and property seed files, plus the bounded-parallel feed
//! loader the binary runs before reconciliation.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::feed::{FeedError, FeedSource, ParseOptions, PropertyIndex, parse_feed};
use crate::model::*;
use crate::store::{InMemoryStore, StoreError};

/// One feed artifact as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedDescriptor {
    pub feed_identifier: String,
    /// File holding the raw feed body. Relative paths are resolved against
    /// the manifest's directory.
    pub path: PathBuf,
    /// Platform name as in `Platform::as_str`. Detected from content when absent.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub property_name: Option<String>,
}

/// Property and guest-override tables to load into the store at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertySeed {
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub guest_overrides: Vec<GuestOverride>,
}

/// Feeds that parsed, and those that did not.
#[derive(Debug, Default)]
pub struct LoadedFeeds {
    pub parsed: Vec<(String, Vec<Entry>)>,
    pub failed: Vec<FeedError>,
}

pub fn load_manifest(path: &Path) -> io::Result<Vec<FeedDescriptor>> {
    let raw = std::fs::read_to_string(path)?;
    let mut feeds: Vec<FeedDescriptor> = serde_json::from_str(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let base = path.parent().unwrap_or(Path::new("."));
    for feed in &mut feeds {
        if feed.path.is_relative() {
            feed.path = base.join(&feed.path);
        }
    }
    Ok(feeds)
}

/// `Ok(None)` when there is no seed file.
pub fn load_property_seed(path: &Path) -> io::Result<Option<PropertySeed>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn apply_seed(store: &InMemoryStore, seed: PropertySeed) -> Result<(), StoreError> {
    let (properties, overrides) = (seed.properties.len(), seed.guest_overrides.len());
    for property in seed.properties {
        store.upsert_property(property).await?;
    }
    for rule in seed.guest_overrides {
        store.upsert_guest_override(rule).await?;
    }
    info!("seeded {properties} properties and {overrides} guest overrides");
    Ok(())
}

/// Read and parse every feed, at most `max_parallel` at a time.
///
/// A feed that fails is reported in `failed` and contributes nothing; its
/// file is left where it is. Results keep manifest order.
pub async fn load_feeds(
    feeds: Vec<FeedDescriptor>,
    index: Arc<PropertyIndex>,
    opts: ParseOptions,
    max_parallel: usize,
) -> LoadedFeeds {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let tasks = feeds.into_iter().map(|descriptor| {
        let semaphore = semaphore.clone();
        let index = index.clone();
        let feed = descriptor.feed_identifier.clone();
        let handle = tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => load_one(descriptor, &index, opts).await,
                Err(e) => Err(FeedError::Unreadable {
                    feed: descriptor.feed_identifier,
                    message: e.to_string(),
                }),
            }
        });
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FeedError::Malformed {
                    feed,
                    message: format!("parser task failed: {e}"),
                }),
            }
        }
    });

    let mut loaded = LoadedFeeds::default();
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(parsed) => loaded.parsed.push(parsed),
            Err(e) => {
                warn!("{e}; source left in place for retry");
                metrics::counter!(crate::observability::FEEDS_FAILED_TOTAL).increment(1);
                loaded.failed.push(e);
            }
        }
    }
    loaded
}

async fn load_one(
    descriptor: FeedDescriptor,
    index: &PropertyIndex,
    opts: ParseOptions,
) -> Result<(String, Vec<Entry>), FeedError> {
    let content = tokio::fs::read_to_string(&descriptor.path)
        .await
        .map_err(|e| FeedError::Unreadable {
            feed: descriptor.feed_identifier.clone(),
            message: format!("{}: {e}", descriptor.path.display()),
        })?;

    let platform_hint = match descriptor.platform.as_deref() {
        Some(name) => Some(Platform::parse(name).ok_or_else(|| FeedError::Malformed {
            feed: descriptor.feed_identifier.clone(),
            message: format!("unknown platform '{name}' in manifest"),
        })?),
        None => None,
    };

    let source = FeedSource {
        feed_identifier: descriptor.feed_identifier,
        platform_hint,
        url: descriptor.url,
        property_name: descriptor.property_name,
        content,
    };
    let entries = parse_feed(&source, index, opts)?;
    let platform = entries.platform();
    let entries: Vec<Entry> = entries.collect();
    info!(
        "feed '{}' ({}): {} entries",
        source.feed_identifier,
        platform.as_str(),
        entries.len()
    );
    Ok((source.feed_identifier, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("staysync_test_{name}_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn manifest_paths_resolve_against_manifest_dir() {
        let dir = temp_dir("manifest");
        let path = dir.join("manifest.json");
        std::fs::write(
            &path,
            r#"[
                {"feed_identifier": "evolve-main", "path": "evolve.csv", "platform": "evolve"},
                {"feed_identifier": "abnb-202", "path": "/srv/feeds/202.ics",
                 "url": "https://www.airbnb.com/calendar/ical/1.ics", "property_name": "Beach House #202"}
            ]"#,
        )
        .unwrap();

        let feeds = load_manifest(&path).unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].path, dir.join("evolve.csv"));
        assert_eq!(feeds[0].platform.as_deref(), Some("evolve"));
        assert_eq!(feeds[1].path, PathBuf::from("/srv/feeds/202.ics"));
        assert_eq!(feeds[1].property_name.as_deref(), Some("Beach House #202"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_seed_is_not_an_error() {
        let dir = temp_dir("seed");
        assert!(load_property_seed(&dir.join("properties.json")).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failing_feed_does_not_block_others() {
        let dir = temp_dir("load");
        let property = Property {
            id: Ulid::new(),
            name: "Beach House".into(),
            listing_number: Some(202),
        };
        std::fs::write(
            dir.join("good.csv"),
            "Reservation,Property,Check-In,Check-Out,Guest\nR-1,Beach House,2026-06-01,2026-06-05,Jane\n",
        )
        .unwrap();
        std::fs::write(dir.join("bad.csv"), "Reservation,Check-In\nR-2,2026-06-01\n").unwrap();

        let descriptor = |id: &str, file: &str| FeedDescriptor {
            feed_identifier: id.into(),
            path: dir.join(file),
            platform: None,
            url: None,
            property_name: None,
        };
        let feeds = vec![
            descriptor("good", "good.csv"),
            descriptor("bad", "bad.csv"),
            descriptor("gone", "missing.csv"),
        ];
        let index = Arc::new(PropertyIndex::build(&[property], &[]));
        let opts = ParseOptions {
            today: NaiveDate::from_ymd_opt(2026, 5, 20).unwrap(),
            lookback_days: 30,
            lookahead_days: 365,
        };

        let loaded = load_feeds(feeds, index, opts, 2).await;
        assert_eq!(loaded.parsed.len(), 1);
        assert_eq!(loaded.parsed[0].0, "good");
        assert_eq!(loaded.parsed[0].1.len(), 1);
        assert_eq!(loaded.failed.len(), 2);
        assert!(matches!(loaded.failed[0], FeedError::MissingColumns { .. }));
        assert_eq!(loaded.failed[0].feed(), "bad");
        assert!(matches!(loaded.failed[1], FeedError::Unreadable { .. }));
        // Failed artifacts stay put.
        assert!(dir.join("bad.csv").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
