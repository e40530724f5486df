use std::path::PathBuf;
use std::time::Duration;

use crate::limits::*;

/// How an incoming entry without a primary uid match is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Match on `(entity_uid, feed_identifier)`, or the uid a record was
    /// last reported under.
    PrimaryOnly,
    /// Fall back to the `(property, dates, kind)` slot within the same feed.
    Hybrid,
}

impl MatchStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "primary_only" | "primary-only" => Some(MatchStrategy::PrimaryOnly),
            "hybrid" => Some(MatchStrategy::Hybrid),
            _ => None,
        }
    }
}

/// Knobs the reconciler itself needs.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub match_strategy: MatchStrategy,
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Carried-field key holding the downstream job linkage.
    pub job_link_field: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            match_strategy: MatchStrategy::Hybrid,
            batch_size: MAX_BATCH_SIZE,
            max_retries: MAX_STORE_RETRIES,
            base_backoff: Duration::from_millis(500),
            job_link_field: "service_job_id".into(),
        }
    }
}

/// Process-wide settings, read from `STAYSYNC_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub feed_manifest: PathBuf,
    pub lookback_days: i64,
    pub lookahead_days: i64,
    pub max_parallel_feeds: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub reconcile: ReconcileSettings,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<i64>().ok());

        let defaults = ReconcileSettings::default();
        let reconcile = ReconcileSettings {
            match_strategy: lookup("STAYSYNC_MATCH_STRATEGY")
                .and_then(|s| MatchStrategy::parse(&s))
                .unwrap_or(defaults.match_strategy),
            batch_size: parsed("STAYSYNC_BATCH_SIZE")
                .map(|n| n.clamp(1, MAX_BATCH_SIZE as i64) as usize)
                .unwrap_or(defaults.batch_size),
            max_retries: parsed("STAYSYNC_MAX_RETRIES")
                .map(|n| n.clamp(0, MAX_STORE_RETRIES as i64) as u32)
                .unwrap_or(defaults.max_retries),
            base_backoff: parsed("STAYSYNC_BACKOFF_MS")
                .map(|n| Duration::from_millis(n.clamp(1, MAX_BACKOFF_MS as i64) as u64))
                .unwrap_or(defaults.base_backoff),
            job_link_field: lookup("STAYSYNC_JOB_LINK_FIELD")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.job_link_field),
        };

        Self {
            data_dir: lookup("STAYSYNC_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            feed_manifest: lookup("STAYSYNC_FEEDS")
                .unwrap_or_else(|| "./feeds/manifest.json".into())
                .into(),
            lookback_days: parsed("STAYSYNC_LOOKBACK_DAYS")
                .map(|n| n.clamp(0, MAX_LOOKBACK_DAYS))
                .unwrap_or(30),
            lookahead_days: parsed("STAYSYNC_LOOKAHEAD_DAYS")
                .map(|n| n.clamp(0, MAX_LOOKAHEAD_DAYS))
                .unwrap_or(365),
            max_parallel_feeds: parsed("STAYSYNC_MAX_PARALLEL_FEEDS")
                .map(|n| n.clamp(1, MAX_PARALLEL_FEEDS as i64) as usize)
                .unwrap_or(4),
            compact_threshold: lookup("STAYSYNC_COMPACT_THRESHOLD")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(1000),
            metrics_port: lookup("STAYSYNC_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            reconcile,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("records.wal")
    }

    pub fn properties_path(&self) -> PathBuf {
        self.data_dir.join("properties.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings_from(&[]);
        assert_eq!(s.lookback_days, 30);
        assert_eq!(s.lookahead_days, 365);
        assert_eq!(s.reconcile.match_strategy, MatchStrategy::Hybrid);
        assert_eq!(s.reconcile.batch_size, MAX_BATCH_SIZE);
        assert_eq!(s.reconcile.job_link_field, "service_job_id");
        assert_eq!(s.metrics_port, None);
        assert_eq!(s.wal_path(), PathBuf::from("./data/records.wal"));
    }

    #[test]
    fn reads_overrides() {
        let s = settings_from(&[
            ("STAYSYNC_MATCH_STRATEGY", "primary"),
            ("STAYSYNC_LOOKBACK_DAYS", "7"),
            ("STAYSYNC_BATCH_SIZE", "4"),
            ("STAYSYNC_JOB_LINK_FIELD", "hcp_job"),
            ("STAYSYNC_METRICS_PORT", "9100"),
        ]);
        assert_eq!(s.reconcile.match_strategy, MatchStrategy::PrimaryOnly);
        assert_eq!(s.lookback_days, 7);
        assert_eq!(s.reconcile.batch_size, 4);
        assert_eq!(s.reconcile.job_link_field, "hcp_job");
        assert_eq!(s.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back_and_bounds_clamp() {
        let s = settings_from(&[
            ("STAYSYNC_MATCH_STRATEGY", "fuzzy"),
            ("STAYSYNC_LOOKAHEAD_DAYS", "soon"),
            ("STAYSYNC_BATCH_SIZE", "500"),
            ("STAYSYNC_MAX_PARALLEL_FEEDS", "0"),
        ]);
        assert_eq!(s.reconcile.match_strategy, MatchStrategy::Hybrid);
        assert_eq!(s.lookahead_days, 365);
        assert_eq!(s.reconcile.batch_size, MAX_BATCH_SIZE);
        assert_eq!(s.max_parallel_feeds, 1);
    }
}
