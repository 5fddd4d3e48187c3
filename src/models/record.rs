//! Harvested records and the non-destructive merge rules applied to them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A single field value: plain text or a list (image URLs, sizes, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Empty strings, whitespace and lists without a non-blank entry count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(v) => v.iter().all(|s| s.trim().is_empty()),
        }
    }

    /// Individual values, in order.
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Text(s) => vec![s.as_str()],
            FieldValue::List(v) => v.iter().map(String::as_str).collect(),
        }
    }

    /// Flatten to a single string, joining lists with `sep`.
    pub fn joined(&self, sep: &str) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(v) => v.join(sep),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        FieldValue::List(v)
    }
}

/// Which fields make a record complete and which ones hold lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSchema {
    pub required: Vec<String>,
    pub list_fields: Vec<String>,
}

impl RecordSchema {
    pub fn new(required: &[&str]) -> Self {
        Self {
            required: required.iter().map(|s| s.to_string()).collect(),
            list_fields: Vec::new(),
        }
    }

    pub fn with_list_fields(mut self, list_fields: &[&str]) -> Self {
        self.list_fields = list_fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_list_field(&self, name: &str) -> bool {
        self.list_fields.iter().any(|f| f == name)
    }
}

/// Fields harvested for one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Names of fields that are present and non-empty.
    pub fn completeness(&self) -> BTreeSet<&str> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Required fields that are absent or empty.
    pub fn missing<'a>(&self, schema: &'a RecordSchema) -> Vec<&'a str> {
        let present = self.completeness();
        schema
            .required
            .iter()
            .map(String::as_str)
            .filter(|f| !present.contains(f))
            .collect()
    }

    pub fn is_complete(&self, schema: &RecordSchema) -> bool {
        self.missing(schema).is_empty()
    }

    /// Merge `incoming` into this record.
    ///
    /// Empty incoming values are ignored. Without `force`, only fields that
    /// are currently absent or empty are written. Returns whether anything
    /// changed.
    pub fn merge(&mut self, incoming: &Record, force: bool) -> bool {
        let mut changed = false;
        for (name, value) in &incoming.fields {
            if value.is_empty() {
                continue;
            }
            let writable = match self.fields.get(name) {
                None => true,
                Some(existing) if existing.is_empty() => true,
                Some(existing) => force && existing != value,
            };
            if writable {
                self.fields.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> RecordSchema {
        RecordSchema::new(&["title", "price"]).with_list_fields(&["images"])
    }

    #[test]
    fn completeness_ignores_blank_values() {
        let record = Record::new("a")
            .with_field("title", "Wool coat")
            .with_field("price", "  ")
            .with_field("images", vec![String::new()]);
        assert_eq!(record.completeness().into_iter().collect::<Vec<_>>(), vec!["title"]);
        assert_eq!(record.missing(&schema()), vec!["price"]);
        assert!(!record.is_complete(&schema()));
    }

    #[test]
    fn merge_never_blanks_existing_fields() {
        let mut existing = Record::new("a")
            .with_field("title", "Wool coat")
            .with_field("price", "USD 120");
        let incoming = Record::new("a")
            .with_field("title", "")
            .with_field("price", "USD 99")
            .with_field("color", "navy");

        assert!(existing.merge(&incoming, false));
        assert_eq!(existing.get("title"), Some(&FieldValue::from("Wool coat")));
        assert_eq!(existing.get("price"), Some(&FieldValue::from("USD 120")));
        assert_eq!(existing.get("color"), Some(&FieldValue::from("navy")));
    }

    #[test]
    fn forced_merge_overwrites_non_empty_but_not_with_blanks() {
        let mut existing = Record::new("a")
            .with_field("title", "Wool coat")
            .with_field("price", "USD 120");
        let incoming = Record::new("a")
            .with_field("title", "")
            .with_field("price", "USD 99");

        assert!(existing.merge(&incoming, true));
        assert_eq!(existing.get("title"), Some(&FieldValue::from("Wool coat")));
        assert_eq!(existing.get("price"), Some(&FieldValue::from("USD 99")));
    }

    #[test]
    fn identical_merge_reports_no_change() {
        let mut existing = Record::new("a").with_field("title", "Wool coat");
        let same = existing.clone();
        assert!(!existing.merge(&same, false));
        assert!(!existing.merge(&same, true));
    }
}
