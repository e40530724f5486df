use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::{FeedError, FeedSource, ParseOptions, PropertyIndex, classify, note_skip, parse_date};

/// Column layout of one spreadsheet export format.
struct Layout {
    platform: Platform,
    uid: &'static str,
    property: &'static str,
    checkin: &'static str,
    checkout: &'static str,
    guest: Option<&'static str>,
    status: Option<&'static str>,
    same_day: Option<&'static str>,
    /// Free text scanned by the keyword classifier.
    descriptive: &'static [&'static str],
}

impl Layout {
    fn required(&self) -> [&'static str; 4] {
        [self.uid, self.property, self.checkin, self.checkout]
    }
}

const LAYOUTS: &[Layout] = &[
    Layout {
        platform: Platform::Evolve,
        uid: "Reservation",
        property: "Property",
        checkin: "Check-In",
        checkout: "Check-Out",
        guest: Some("Guest"),
        status: Some("Status"),
        same_day: None,
        descriptive: &["Type", "Status"],
    },
    Layout {
        platform: Platform::ITrip,
        uid: "Confirmation",
        property: "Property Name",
        checkin: "Checkin",
        checkout: "Checkout",
        guest: Some("Guest Name"),
        status: None,
        same_day: Some("Same Day"),
        descriptive: &["Notes"],
    },
];

fn layout_for(platform: Platform) -> Option<&'static Layout> {
    LAYOUTS.iter().find(|l| l.platform == platform)
}

/// Header shape decides the layout; a tabular hint overrides it.
fn choose_layout(headers: &[String], hint: Option<Platform>) -> Option<&'static Layout> {
    if let Some(layout) = hint.and_then(layout_for) {
        return Some(layout);
    }
    LAYOUTS
        .iter()
        .map(|l| {
            let present = l
                .required()
                .iter()
                .filter(|c| headers.iter().any(|h| h == &c.to_lowercase()))
                .count();
            (present, l)
        })
        .filter(|(present, _)| *present > 0)
        .max_by_key(|(present, _)| *present)
        .map(|(_, l)| l)
}

fn parse_same_day(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub(super) fn parse(
    source: &FeedSource,
    index: &PropertyIndex,
    opts: ParseOptions,
) -> Result<(Platform, Vec<Entry>), FeedError> {
    let feed = source.feed_identifier.as_str();
    let csv_err = |e: csv::Error| FeedError::Csv {
        feed: feed.to_string(),
        message: e.to_string(),
    };

    let content = source.content.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let layout = choose_layout(&headers, source.platform_hint)
        .ok_or_else(|| FeedError::UnknownFormat(feed.to_string()))?;

    let position = |name: &str| {
        let name = name.to_lowercase();
        headers.iter().position(|h| *h == name)
    };
    let missing: Vec<String> = layout
        .required()
        .iter()
        .filter(|c| position(c).is_none())
        .map(|c| c.to_string())
        .collect();
    let [uid_i, property_i, checkin_i, checkout_i] = match layout.required().map(position) {
        [Some(a), Some(b), Some(c), Some(d)] => [a, b, c, d],
        _ => {
            return Err(FeedError::MissingColumns {
                feed: feed.to_string(),
                columns: missing,
            });
        }
    };
    let guest_i = layout.guest.and_then(position);
    let status_i = layout.status.and_then(position);
    let same_day_i = layout.same_day.and_then(position);
    let descriptive: Vec<(String, usize)> = layout
        .descriptive
        .iter()
        .filter_map(|c| position(c).map(|i| (c.to_lowercase(), i)))
        .collect();

    let mut entries = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 2; // header is row 1
        let record = record.map_err(csv_err)?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        let get = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");
        let what = format!("row {row}");

        let uid = get(Some(uid_i));
        if uid.is_empty() {
            note_skip(feed, &what, "missing_uid");
            continue;
        }
        if uid.len() > MAX_UID_LEN {
            note_skip(feed, &what, "uid_too_long");
            continue;
        }

        let status = get(status_i);
        if status.to_lowercase().contains("cancel") {
            debug!("feed '{feed}': {what} ({uid}) is cancelled");
            continue;
        }

        let (Some(start), Some(end)) = (parse_date(get(Some(checkin_i))), parse_date(get(Some(checkout_i)))) else {
            note_skip(feed, &what, "bad_date");
            continue;
        };
        let Some(span) = DateSpan::try_new(start, end) else {
            note_skip(feed, &what, "end_not_after_start");
            continue;
        };
        if !opts.in_window(span.start) {
            debug!("feed '{feed}': {what} ({uid}) starts {} outside window", span.start);
            continue;
        }

        let property_name = get(Some(property_i));
        let guest = get(guest_i);
        let property_ref = index
            .resolve_entry(Some(property_name), (!guest.is_empty()).then_some(guest))
            .ok_or_else(|| FeedError::UnresolvedProperty {
                feed: feed.to_string(),
                row,
                name: property_name.to_string(),
            })?;

        let mut metadata = Metadata::new();
        if !guest.is_empty() {
            metadata.insert("guest".into(), guest.to_string());
        }
        let mut text = Vec::new();
        for (name, idx) in &descriptive {
            let value = get(Some(*idx));
            if !value.is_empty() {
                metadata.insert(name.clone(), value.to_string());
                text.push(value);
            }
        }
        let (entry_kind, service_kind) = classify(&text.join(" "));

        entries.push(Entry {
            entity_uid: uid.to_string(),
            feed_identifier: feed.to_string(),
            property_ref: Some(property_ref),
            span,
            entry_kind,
            service_kind,
            source_platform: layout.platform,
            overlapping: false,
            same_day_turnover: false,
            upstream_same_day_override: parse_same_day(get(same_day_i)),
            metadata,
        });
    }

    debug!("feed '{feed}': {} {} rows accepted", entries.len(), layout.platform.as_str());
    Ok((layout.platform, entries))
}
