use std::iter::Peekable;
use std::str::Lines;

use chrono::NaiveDate;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::{FeedSource, ParseOptions, PropertyIndex, classify, note_skip};

pub(super) fn looks_like_calendar(content: &str) -> bool {
    content
        .trim_start_matches('\u{feff}')
        .trim_start()
        .get(..15)
        .is_some_and(|head| head.eq_ignore_ascii_case("BEGIN:VCALENDAR"))
}

/// Platform from URL and `PRODID` keywords; a calendar hint fills in when
/// nothing more specific is found.
pub(super) fn detect_platform(source: &FeedSource) -> Platform {
    let prodid = Unfold::new(&source.content)
        .take_while(|l| !l.eq_ignore_ascii_case("BEGIN:VEVENT"))
        .find_map(|l| {
            let (name, value) = split_property(&l)?;
            (name == "PRODID").then_some(value)
        })
        .unwrap_or_default();
    let haystack = format!("{} {}", source.url.as_deref().unwrap_or(""), prodid).to_lowercase();

    const KEYWORDS: &[(&str, Platform)] = &[
        ("airbnb", Platform::Airbnb),
        ("vrbo", Platform::Vrbo),
        ("homeaway", Platform::Vrbo),
        ("booking.com", Platform::BookingCom),
        ("hospitable", Platform::Hospitable),
    ];
    KEYWORDS
        .iter()
        .find(|(k, _)| haystack.contains(k))
        .map(|(_, p)| *p)
        .or(source.platform_hint.filter(|p| !p.is_tabular()))
        .unwrap_or(Platform::Generic)
}

/// Content lines with RFC 5545 folding undone.
struct Unfold<'a> {
    lines: Peekable<Lines<'a>>,
}

impl<'a> Unfold<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.trim_start_matches('\u{feff}').lines().peekable(),
        }
    }
}

impl Iterator for Unfold<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut line = self.lines.next()?.trim_end_matches('\r').to_string();
        while let Some(next) = self.lines.peek() {
            if next.starts_with(' ') || next.starts_with('\t') {
                line.push_str(next[1..].trim_end_matches('\r'));
                self.lines.next();
            } else {
                break;
            }
        }
        Some(line)
    }
}

/// `NAME;PARAM=X:value` → (`NAME`, unescaped value).
fn split_property(line: &str) -> Option<(String, String)> {
    let (head, value) = line.split_once(':')?;
    let name = head.split(';').next().unwrap_or(head).trim().to_ascii_uppercase();
    Some((name, unescape(value)))
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `20260601` or `20260601T150000Z` → the date part.
fn parse_ics_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim().get(..8)?, "%Y%m%d").ok()
}

#[derive(Default)]
struct RawEvent {
    uid: Option<String>,
    start: Option<String>,
    end: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
}

/// Lazily yields one `Entry` per usable `VEVENT`.
pub struct CalendarEntries<'a> {
    lines: Unfold<'a>,
    source: &'a FeedSource,
    platform: Platform,
    index: &'a PropertyIndex,
    opts: ParseOptions,
    seen: usize,
}

impl<'a> CalendarEntries<'a> {
    pub(super) fn new(
        source: &'a FeedSource,
        platform: Platform,
        index: &'a PropertyIndex,
        opts: ParseOptions,
    ) -> Self {
        Self {
            lines: Unfold::new(&source.content),
            source,
            platform,
            index,
            opts,
            seen: 0,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn next_raw(&mut self) -> Option<RawEvent> {
        let mut current: Option<RawEvent> = None;
        for line in self.lines.by_ref() {
            if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
                current = Some(RawEvent::default());
                continue;
            }
            if line.eq_ignore_ascii_case("END:VEVENT") {
                if let Some(event) = current.take() {
                    return Some(event);
                }
                continue;
            }
            let Some(event) = current.as_mut() else { continue };
            let Some((name, value)) = split_property(&line) else { continue };
            let slot = match name.as_str() {
                "UID" => &mut event.uid,
                "DTSTART" => &mut event.start,
                "DTEND" => &mut event.end,
                "SUMMARY" => &mut event.summary,
                "DESCRIPTION" => &mut event.description,
                "LOCATION" => &mut event.location,
                _ => continue,
            };
            *slot = Some(value);
        }
        None
    }

    fn to_entry(&self, raw: RawEvent) -> Option<Entry> {
        let feed = self.source.feed_identifier.as_str();
        let what = format!("event {}", self.seen);

        let Some(uid) = raw.uid.filter(|u| !u.trim().is_empty()) else {
            note_skip(feed, &what, "missing_uid");
            return None;
        };
        let uid = uid.trim().to_string();
        if uid.len() > MAX_UID_LEN {
            note_skip(feed, &what, "uid_too_long");
            return None;
        }
        let what = format!("event {uid}");

        let (Some(start), Some(end)) = (
            raw.start.as_deref().and_then(parse_ics_date),
            raw.end.as_deref().and_then(parse_ics_date),
        ) else {
            note_skip(feed, &what, "bad_date");
            return None;
        };
        let Some(span) = DateSpan::try_new(start, end) else {
            note_skip(feed, &what, "end_not_after_start");
            return None;
        };
        if !self.opts.in_window(span.start) {
            debug!("feed '{feed}': {what} starts {} outside window", span.start);
            return None;
        }

        let summary = raw.summary.unwrap_or_default();
        let description = raw.description.unwrap_or_default();
        let text = format!("{summary} {description}");
        let property_name = self
            .source
            .property_name
            .as_deref()
            .or(raw.location.as_deref());
        let Some(property_ref) = self.index.resolve_entry(property_name, Some(text.as_str())) else {
            note_skip(feed, &what, "unresolved_property");
            return None;
        };

        let (entry_kind, service_kind) = classify(&text);
        let mut metadata = Metadata::new();
        if !summary.is_empty() {
            metadata.insert("summary".into(), summary);
        }
        if !description.is_empty() {
            metadata.insert("description".into(), description);
        }

        Some(Entry {
            entity_uid: uid,
            feed_identifier: feed.to_string(),
            property_ref: Some(property_ref),
            span,
            entry_kind,
            service_kind,
            source_platform: self.platform,
            overlapping: false,
            same_day_turnover: false,
            upstream_same_day_override: None,
            metadata,
        })
    }
}

impl Iterator for CalendarEntries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let raw = self.next_raw()?;
            self.seen += 1;
            if let Some(entry) = self.to_entry(raw) {
                return Some(entry);
            }
        }
    }
}
