//! Flag Calculator: `overlapping` and `same_day_turnover` per property, over
//! the entries of the current run only.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::model::{Entry, PropertyId};

/// Recompute both flags in place. Entries without a property are left unflagged.
/// Blocks take part like reservations: a block on a booked night is an overlap.
pub fn compute_flags(entries: &mut [Entry]) {
    let mut groups: HashMap<PropertyId, Vec<usize>> = HashMap::new();
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.overlapping = false;
        entry.same_day_turnover = false;
        if let Some(property) = entry.property_ref {
            groups.entry(property).or_default().push(i);
        }
    }

    for members in groups.values_mut() {
        flag_overlaps(entries, members);
        flag_same_day(entries, members);
    }

    for entry in entries.iter_mut() {
        if let Some(forced) = entry.upstream_same_day_override {
            entry.same_day_turnover = forced;
        }
    }
}

/// Sort by start; each entry only needs to look ahead while later starts
/// fall before its own end.
fn flag_overlaps(entries: &mut [Entry], members: &mut [usize]) {
    members.sort_by_key(|&i| (entries[i].span.start, entries[i].span.end));
    for (pos, &i) in members.iter().enumerate() {
        let end = entries[i].span.end;
        let right_bound = pos
            + 1
            + members[pos + 1..].partition_point(|&j| entries[j].span.start < end);
        for &j in &members[pos + 1..right_bound] {
            if entries[i].span.overlaps(&entries[j].span) {
                entries[i].overlapping = true;
                entries[j].overlapping = true;
            }
        }
    }
}

fn flag_same_day(entries: &mut [Entry], members: &[usize]) {
    let starts: HashSet<NaiveDate> = members.iter().map(|&i| entries[i].span.start).collect();
    for &i in members {
        // start < end, so an entry never matches its own check-in.
        if starts.contains(&entries[i].span.end) {
            entries[i].same_day_turnover = true;
        }
    }
}
