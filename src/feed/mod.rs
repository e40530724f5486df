//! Feed Parser: raw spreadsheet exports and calendar feeds in, `Entry` drafts out.
//!
//! Structural problems (missing columns, unknown format, an unresolvable
//! property on a spreadsheet row) reject the whole feed. Bad rows and
//! calendar events with bad dates or unknown properties are skipped and
//! logged, and the rest of the feed still parses.

mod calendar;
mod classify;
mod error;
mod property;
mod tabular;

pub use calendar::CalendarEntries;
pub use classify::classify;
pub use error::FeedError;
pub use property::{PropertyIndex, listing_code};

use chrono::{Days, NaiveDate};
use tracing::warn;

use crate::limits::*;
use crate::model::*;

/// Raw content of one feed, as handed over by the content provider.
#[derive(Debug, Clone)]
pub struct FeedSource {
    pub feed_identifier: String,
    pub platform_hint: Option<Platform>,
    /// Where the calendar was fetched from; used for platform detection.
    pub url: Option<String>,
    /// Property a calendar feed belongs to. Events fall back to `LOCATION`.
    pub property_name: Option<String>,
    pub content: String,
}

/// The `[today - lookback, today + lookahead]` window on `start_date`.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub today: NaiveDate,
    pub lookback_days: i64,
    pub lookahead_days: i64,
}

impl ParseOptions {
    pub fn window(&self) -> (NaiveDate, NaiveDate) {
        let back = Days::new(self.lookback_days.max(0) as u64);
        let ahead = Days::new(self.lookahead_days.max(0) as u64);
        (
            self.today.checked_sub_days(back).unwrap_or(NaiveDate::MIN),
            self.today.checked_add_days(ahead).unwrap_or(NaiveDate::MAX),
        )
    }

    pub fn in_window(&self, start: NaiveDate) -> bool {
        let (lo, hi) = self.window();
        lo <= start && start <= hi
    }
}

/// Entries of one feed. Calendar feeds are parsed lazily; spreadsheets are
/// validated in full before the first entry is handed out.
pub enum FeedEntries<'a> {
    Tabular {
        platform: Platform,
        rows: std::vec::IntoIter<Entry>,
    },
    Calendar(CalendarEntries<'a>),
}

impl FeedEntries<'_> {
    pub fn platform(&self) -> Platform {
        match self {
            FeedEntries::Tabular { platform, .. } => *platform,
            FeedEntries::Calendar(c) => c.platform(),
        }
    }
}

impl Iterator for FeedEntries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        match self {
            FeedEntries::Tabular { rows, .. } => rows.next(),
            FeedEntries::Calendar(c) => c.next(),
        }
    }
}

/// Detect the platform and parse. Any `Err` means nothing from this feed
/// may be applied.
pub fn parse_feed<'a>(
    source: &'a FeedSource,
    index: &'a PropertyIndex,
    opts: ParseOptions,
) -> Result<FeedEntries<'a>, FeedError> {
    if source.content.len() > MAX_FEED_BYTES {
        return Err(FeedError::TooLarge {
            feed: source.feed_identifier.clone(),
            bytes: source.content.len(),
        });
    }

    if calendar::looks_like_calendar(&source.content) {
        let platform = calendar::detect_platform(source);
        return Ok(FeedEntries::Calendar(CalendarEntries::new(
            source, platform, index, opts,
        )));
    }

    if source.platform_hint.is_some_and(|p| !p.is_tabular()) {
        return Err(FeedError::Malformed {
            feed: source.feed_identifier.clone(),
            message: "calendar feed without BEGIN:VCALENDAR".into(),
        });
    }

    let (platform, rows) = tabular::parse(source, index, opts)?;
    Ok(FeedEntries::Tabular {
        platform,
        rows: rows.into_iter(),
    })
}

/// Log and count a dropped row/event.
pub(crate) fn note_skip(feed: &str, what: &str, reason: &'static str) {
    warn!("feed '{feed}': skipping {what}: {reason}");
    metrics::counter!(crate::observability::FEED_ROWS_SKIPPED_TOTAL, "reason" => reason)
        .increment(1);
}

/// Dates as they appear in exports: ISO, US long and short year.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some((_, year)) = raw.rsplit_once('/') {
        // %Y would happily read "26" as the year 26.
        let fmt = if year.len() == 2 { "%m/%d/%y" } else { "%m/%d/%Y" };
        return NaiveDate::parse_from_str(raw, fmt).ok();
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    // ISO date-time: keep the date part.
    raw.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn date_formats() {
        assert_eq!(parse_date("2026-06-01"), Some(d(2026, 6, 1)));
        assert_eq!(parse_date("06/01/2026"), Some(d(2026, 6, 1)));
        assert_eq!(parse_date("6/1/26"), Some(d(2026, 6, 1)));
        assert_eq!(parse_date("2026-06-01T15:00:00Z"), Some(d(2026, 6, 1)));
        assert_eq!(parse_date("June 1st"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn window_is_inclusive() {
        let opts = ParseOptions {
            today: d(2026, 6, 10),
            lookback_days: 5,
            lookahead_days: 10,
        };
        assert!(opts.in_window(d(2026, 6, 5)));
        assert!(opts.in_window(d(2026, 6, 20)));
        assert!(!opts.in_window(d(2026, 6, 4)));
        assert!(!opts.in_window(d(2026, 6, 21)));
    }

    #[test]
    fn oversized_feed_rejected() {
        let source = FeedSource {
            feed_identifier: "big".into(),
            platform_hint: None,
            url: None,
            property_name: None,
            content: "x".repeat(MAX_FEED_BYTES + 1),
        };
        let index = PropertyIndex::default();
        let opts = ParseOptions {
            today: d(2026, 6, 1),
            lookback_days: 30,
            lookahead_days: 365,
        };
        assert!(matches!(
            parse_feed(&source, &index, opts),
            Err(FeedError::TooLarge { .. })
        ));
    }

    #[test]
    fn calendar_hint_without_calendar_body_fails() {
        let source = FeedSource {
            feed_identifier: "ics".into(),
            platform_hint: Some(Platform::Airbnb),
            url: None,
            property_name: None,
            content: "<html>login required</html>".into(),
        };
        let index = PropertyIndex::build(
            &[Property {
                id: Ulid::new(),
                name: "Beach House".into(),
                listing_number: None,
            }],
            &[],
        );
        let opts = ParseOptions {
            today: d(2026, 6, 1),
            lookback_days: 30,
            lookahead_days: 365,
        };
        assert!(matches!(
            parse_feed(&source, &index, opts),
            Err(FeedError::Malformed { .. })
        ));
    }
}
