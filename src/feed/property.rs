use std::collections::HashMap;

use crate::model::{GuestOverride, Property, PropertyId};

/// Read-only lookup tables built once per run and shared across feed tasks.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndex {
    by_name: HashMap<String, PropertyId>,
    by_listing: HashMap<u32, PropertyId>,
    /// Lowercased patterns, longest first so the most specific wins.
    overrides: Vec<(String, PropertyId)>,
}

impl PropertyIndex {
    pub fn build(properties: &[Property], overrides: &[GuestOverride]) -> Self {
        let mut by_name = HashMap::new();
        let mut by_listing = HashMap::new();
        for p in properties {
            by_name.insert(normalize(&p.name), p.id);
            if let Some(n) = p.listing_number {
                by_listing.insert(n, p.id);
            }
        }

        let mut rules: Vec<(String, PropertyId)> = overrides
            .iter()
            .map(|o| (normalize(&o.pattern), o.property_id))
            .filter(|(pattern, _)| !pattern.is_empty())
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            by_name,
            by_listing,
            overrides: rules,
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Case-insensitive exact name, then the trailing `#NNN` listing code.
    pub fn resolve(&self, name: &str) -> Option<PropertyId> {
        if let Some(id) = self.by_name.get(&normalize(name)) {
            return Some(*id);
        }
        listing_code(name).and_then(|code| self.by_listing.get(&code).copied())
    }

    pub fn guest_override(&self, guest_text: &str) -> Option<PropertyId> {
        let haystack = guest_text.to_lowercase();
        self.overrides
            .iter()
            .find(|(pattern, _)| haystack.contains(pattern.as_str()))
            .map(|(_, id)| *id)
    }

    /// A guest override beats the named property.
    pub fn resolve_entry(&self, name: Option<&str>, guest_text: Option<&str>) -> Option<PropertyId> {
        guest_text
            .and_then(|g| self.guest_override(g))
            .or_else(|| name.and_then(|n| self.resolve(n)))
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// `"Beach House #202"` → `202`.
pub fn listing_code(name: &str) -> Option<u32> {
    let (_, tail) = name.trim().rsplit_once('#')?;
    let tail = tail.trim();
    if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    tail.parse().ok()
}
