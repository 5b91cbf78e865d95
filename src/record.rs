//! Record model and identity handling
//!
//! A record is an opaque `id` plus whatever text fields the source carries.
//! The oracle must hand the `id` back untouched; everything else is payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Apostrophe-like characters that have historically broken oracle replies
/// when they appear inside identities.
pub const APOSTROPHE_LIKE: &[char] = &[
    '\u{0027}', // apostrophe
    '\u{2019}', // right single quotation mark
    '\u{2018}', // left single quotation mark
    '\u{201A}', // single low-9 quotation mark
    '\u{201B}', // single high-reversed-9 quotation mark
    '\u{00B4}', // acute accent
    '\u{0060}', // grave accent
    '\u{2032}', // prime
    '\u{2035}', // reversed prime
    '\u{02B9}', // modifier letter prime
    '\u{02BC}', // modifier letter apostrophe
];

/// Replacement used when sanitising identities and when normalising them for comparison.
pub const ID_SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Returns the identities that appear more than once, in first-seen order.
pub fn duplicate_ids(records: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut duplicates = Vec::new();
    for record in records {
        if !seen.insert(record.id.as_str()) && reported.insert(record.id.as_str()) {
            duplicates.push(record.id.clone());
        }
    }
    duplicates
}

/// Replace apostrophe-like characters in every identity with `_`.
///
/// Returns how many identities changed.
pub fn sanitize_ids(records: &mut [Record]) -> usize {
    let mut changed = 0;
    for record in records.iter_mut() {
        if record.id.contains(APOSTROPHE_LIKE) {
            record.id = record.id.replace(APOSTROPHE_LIKE, &ID_SEPARATOR.to_string());
            changed += 1;
        }
    }
    changed
}

pub fn contains_any(id: &str, chars: &[char]) -> bool {
    id.contains(chars)
}

/// Comparison key for final verification: hyphens and apostrophe-like
/// characters collapse onto `_`, so cosmetic separator rewrites applied after
/// the transformation do not look like losses.
pub fn normalize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c == '-' || APOSTROPHE_LIKE.contains(&c) {
                ID_SEPARATOR
            } else {
                c
            }
        })
        .collect()
}

/// Groups of distinct identities that collapse onto the same normalised key.
///
/// A non-empty result means final verification cannot tell those identities
/// apart; losing one of them would go unnoticed.
pub fn normalization_collisions<'a, I>(ids: I) -> Vec<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    let mut order = Vec::new();
    for id in ids {
        let key = normalize_id(id);
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        if !entry.iter().any(|existing| existing == id) {
            entry.push(id.to_string());
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter(|group| group.len() > 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_flat() {
        let record = Record::new("abc").with_field("name", "Tactical Doctrine");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["name"], "Tactical Doctrine");
    }

    #[test]
    fn test_record_keeps_null_fields() {
        let record: Record = serde_json::from_str(r#"{"id":"x","lore":null}"#).unwrap();
        assert_eq!(record.fields.get("lore"), Some(&Value::Null));
        assert_eq!(record.field_str("lore"), None);
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        assert!(serde_json::from_str::<Record>(r#"{"name":"orphan"}"#).is_err());
    }

    #[test]
    fn test_sanitize_ids_replaces_apostrophes() {
        let mut records = vec![
            Record::new("emperor's-wrath"),
            Record::new("plain"),
            Record::new("lion\u{2019}s-roar"),
        ];
        assert_eq!(sanitize_ids(&mut records), 2);
        assert_eq!(records[0].id, "emperor_s-wrath");
        assert_eq!(records[1].id, "plain");
        assert_eq!(records[2].id, "lion_s-roar");
    }

    #[test]
    fn test_normalize_id_treats_separators_as_equal() {
        assert_eq!(normalize_id("a-b_c'd"), "a_b_c_d");
        assert_eq!(normalize_id("a_b"), normalize_id("a-b"));
    }

    #[test]
    fn test_duplicate_ids_reported_once() {
        let records = vec![Record::new("a"), Record::new("b"), Record::new("a"), Record::new("a")];
        assert_eq!(duplicate_ids(&records), vec!["a".to_string()]);
    }

    #[test]
    fn test_normalization_collisions_detected() {
        let ids = ["x-1", "x_1", "y", "z'2", "z-2"];
        let collisions = normalization_collisions(ids.iter().copied());
        assert_eq!(collisions.len(), 2);
        assert_eq!(collisions[0], vec!["x-1".to_string(), "x_1".to_string()]);
        assert_eq!(collisions[1], vec!["z'2".to_string(), "z-2".to_string()]);
    }
}
