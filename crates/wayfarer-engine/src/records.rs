//! The record store.
//!
//! Records are created in bulk from extraction output and accumulate
//! fields from every node that touches them. Every write is namespaced by
//! the producing node's alias (`data[alias][field]`), so two nodes can
//! never silently overwrite each other's field under the same key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Configures how record ids are minted and recognized.
#[derive(Debug, Clone)]
pub struct RecordIdConfig {
    pub prefix: String,
}

impl Default for RecordIdConfig {
    fn default() -> Self {
        Self {
            prefix: "record".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Field map namespaced by producing node alias.
    pub data: Map<String, Value>,
}

impl Record {
    /// Walk `alias.field.deeper...` through the namespaced data.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let alias = segments.next()?;
        let mut current = self.data.get(alias)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Creation-ordered record storage for one workflow execution.
pub struct RecordStore {
    records: Vec<Record>,
    by_id: HashMap<String, usize>,
    id_pattern: Regex,
    prefix: String,
    next_seq: u64,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self::with_config(RecordIdConfig::default())
    }

    pub fn with_config(config: RecordIdConfig) -> Self {
        let pattern = format!("^{}_\\d+$", regex::escape(&config.prefix));
        Self {
            records: Vec::new(),
            by_id: HashMap::new(),
            id_pattern: Regex::new(&pattern).expect("record id pattern"),
            prefix: config.prefix,
            next_seq: 1,
        }
    }

    /// Whether a dotted-expression head looks like a record id.
    pub fn is_record_id(&self, candidate: &str) -> bool {
        self.id_pattern.is_match(candidate)
    }

    /// Create one record per extracted item, fields namespaced under the
    /// extracting node's alias. Non-object items land under a `value`
    /// field. Returns the new ids in creation order.
    pub fn create_batch(&mut self, alias: &str, items: &[Value]) -> Vec<String> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = format!("{}_{}", self.prefix, self.next_seq);
            self.next_seq += 1;

            let fields = match item {
                Value::Object(map) => map.clone(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            };
            let mut data = Map::new();
            data.insert(alias.to_string(), Value::Object(fields));

            self.by_id.insert(id.clone(), self.records.len());
            self.records.push(Record {
                id: id.clone(),
                created_at: Utc::now(),
                data,
            });
            ids.push(id);
        }
        debug!("created {} records under alias '{}'", ids.len(), alias);
        ids
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id).map(|&idx| &self.records[idx])
    }

    /// Write one field onto a record under the producing node's alias.
    /// Returns false when the record does not exist.
    pub fn write_field(&mut self, id: &str, alias: &str, field: &str, value: Value) -> bool {
        let Some(&idx) = self.by_id.get(id) else {
            return false;
        };
        let namespace = self.records[idx]
            .data
            .entry(alias.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = namespace {
            map.insert(field.to_string(), value);
            true
        } else {
            false
        }
    }

    /// Record ids matching a wildcard pattern (`*` and `?`), in creation
    /// order. A bare `*` selects everything.
    pub fn ids_matching(&self, pattern: &str) -> Vec<String> {
        let Some(re) = wildcard_to_regex(pattern) else {
            return Vec::new();
        };
        self.records
            .iter()
            .filter(|r| re.is_match(&r.id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Project one field path across every record in creation order,
    /// skipping records where the path resolves to nothing.
    pub fn project(&self, path: &str) -> Vec<Value> {
        self.records
            .iter()
            .filter_map(|r| r.get_path(path).cloned())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn wildcard_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_creation_namespaces_fields_under_the_alias() {
        let mut store = RecordStore::new();
        let ids = store.create_batch(
            "extract_emails",
            &[
                json!({"subject": "Invoice", "from": "a@x.test"}),
                json!({"subject": "Reminder", "from": "b@x.test"}),
            ],
        );

        assert_eq!(ids, vec!["record_1", "record_2"]);
        let first = store.get("record_1").unwrap();
        assert_eq!(
            first.get_path("extract_emails.subject"),
            Some(&json!("Invoice"))
        );
        assert!(first.get_path("other_node.subject").is_none());
    }

    #[test]
    fn writes_from_two_nodes_never_collide() {
        let mut store = RecordStore::new();
        let ids = store.create_batch("extract", &[json!({"subject": "hi"})]);

        assert!(store.write_field(&ids[0], "classify", "type", json!("newsletter")));
        assert!(store.write_field(&ids[0], "score", "type", json!(0.9)));

        let record = store.get(&ids[0]).unwrap();
        assert_eq!(record.get_path("classify.type"), Some(&json!("newsletter")));
        assert_eq!(record.get_path("score.type"), Some(&json!(0.9)));
    }

    #[test]
    fn projection_skips_records_missing_the_field_and_keeps_order() {
        let mut store = RecordStore::new();
        let ids = store.create_batch(
            "extract",
            &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
        );
        store.write_field(&ids[0], "classify", "type", json!("a"));
        store.write_field(&ids[2], "classify", "type", json!("c"));

        let projected = store.project("classify.type");
        assert_eq!(projected, vec![json!("a"), json!("c")]);
    }

    #[test]
    fn wildcard_matching_respects_creation_order() {
        let mut store = RecordStore::new();
        store.create_batch("x", &[json!({}), json!({}), json!({})]);

        assert_eq!(
            store.ids_matching("record_*"),
            vec!["record_1", "record_2", "record_3"]
        );
        assert_eq!(store.ids_matching("record_2"), vec!["record_2"]);
        assert_eq!(store.ids_matching("record_?"), vec!["record_1", "record_2", "record_3"]);
        assert!(store.ids_matching("order_*").is_empty());
    }

    #[test]
    fn custom_prefix_changes_the_id_pattern() {
        let mut store = RecordStore::with_config(RecordIdConfig {
            prefix: "row".to_string(),
        });
        let ids = store.create_batch("x", &[json!({})]);
        assert_eq!(ids, vec!["row_1"]);
        assert!(store.is_record_id("row_7"));
        assert!(!store.is_record_id("record_7"));
    }
}
