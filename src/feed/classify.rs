use crate::model::{EntryKind, ServiceKind};

/// Ordered keyword table. The first rule with a keyword found in the text
/// wins. Keywords match whole words; a multi-word keyword matches a run of
/// consecutive words.
const RULES: &[(&[&str], EntryKind, ServiceKind)] = &[
    (&["owner stay", "owner arrival", "owner"], EntryKind::Block, ServiceKind::OwnerArrival),
    (&["inspection"], EntryKind::Block, ServiceKind::Inspection),
    (&["maintenance", "repair"], EntryKind::Block, ServiceKind::Maintenance),
    (&["return laundry", "laundry"], EntryKind::Reservation, ServiceKind::ReturnLaundry),
    (
        &["not available", "unavailable", "blocked", "closed", "hold"],
        EntryKind::Block,
        ServiceKind::NeedsReview,
    ),
    (&["reserved", "reservation", "booked", "guest"], EntryKind::Reservation, ServiceKind::Turnover),
];

pub fn classify(text: &str) -> (EntryKind, ServiceKind) {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    RULES
        .iter()
        .find(|(keywords, _, _)| keywords.iter().any(|k| contains_phrase(&words, k)))
        .map(|(_, kind, service)| (*kind, *service))
        .unwrap_or((EntryKind::Reservation, ServiceKind::Turnover))
}

fn contains_phrase(words: &[&str], keyword: &str) -> bool {
    let phrase: Vec<&str> = keyword.split_whitespace().collect();
    !phrase.is_empty() && words.windows(phrase.len()).any(|w| w == phrase.as_slice())
}
