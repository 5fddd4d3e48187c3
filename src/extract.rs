//! Extraction from rendered snapshots.
//!
//! [`ItemExtractor`] turns a listing snapshot into canonical work items;
//! [`DetailExtractor`] turns a detail snapshot into a [`Record`]. Neither
//! fails on missing markup: absent elements yield no items or empty fields.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::models::{FieldValue, IdRules, Record, WorkItem};
use crate::source::Snapshot;

/// Items found on one listing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Deduplicated by id, ordered by id.
    pub items: Vec<WorkItem>,
    /// Links that could not be turned into a work item.
    pub rejected: usize,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Pulls item links from listing markup.
pub struct ItemExtractor {
    selector: Selector,
    attribute: String,
    link_pattern: Option<Regex>,
    id_rules: IdRules,
}

impl ItemExtractor {
    pub fn new(
        selector: &str,
        attribute: &str,
        link_pattern: Option<&str>,
        id_rules: IdRules,
    ) -> Result<Self, String> {
        let selector = Selector::parse(selector)
            .map_err(|e| format!("invalid item selector {:?}: {}", selector, e))?;
        let link_pattern = link_pattern
            .map(|p| Regex::new(p).map_err(|e| format!("invalid link pattern: {}", e)))
            .transpose()?;
        Ok(Self {
            selector,
            attribute: attribute.to_string(),
            link_pattern,
            id_rules,
        })
    }

    /// Extract work items. Relative links resolve against the snapshot address.
    pub fn extract(&self, snapshot: &Snapshot) -> Extraction {
        let base = Url::parse(&snapshot.address).ok();
        let document = snapshot.document();
        let mut items = BTreeMap::new();
        let mut rejected = 0;

        for element in document.select(&self.selector) {
            let Some(raw) = element.value().attr(&self.attribute) else {
                continue;
            };
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') || raw.starts_with("javascript:") {
                continue;
            }

            let address = match base.as_ref().and_then(|b| b.join(raw).ok()) {
                Some(url) => url.to_string(),
                None => raw.to_string(),
            };
            if let Some(ref pattern) = self.link_pattern {
                if !pattern.is_match(&address) {
                    continue;
                }
            }

            match WorkItem::from_address(&address, &self.id_rules) {
                Ok(item) => {
                    items.entry(item.id.clone()).or_insert(item);
                }
                Err(e) => {
                    debug!("Skipping link {:?}: {}", raw, e);
                    rejected += 1;
                }
            }
        }

        if items.is_empty() {
            warn!("No item links found on {}", snapshot.address);
        }

        Extraction {
            items: items.into_values().collect(),
            rejected,
        }
    }
}

/// How to read one field from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRule {
    /// CSS selector. Without one, `pattern` runs over the raw markup.
    pub selector: Option<String>,
    /// Attribute to read instead of the element text.
    pub attribute: Option<String>,
    /// Collect every match into a list instead of the first one.
    pub multiple: bool,
    /// Regex applied to each value (or to the raw markup); group 1 if present.
    pub pattern: Option<String>,
    /// Prepended to every value, e.g. `"https:"` for protocol-relative URLs.
    pub prefix: Option<String>,
}

struct CompiledRule {
    selector: Option<Selector>,
    attribute: Option<String>,
    multiple: bool,
    pattern: Option<Regex>,
    prefix: Option<String>,
}

impl CompiledRule {
    fn compile(name: &str, rule: &FieldRule) -> Result<Self, String> {
        let selector = rule
            .selector
            .as_deref()
            .map(|s| {
                Selector::parse(s).map_err(|e| format!("field {}: invalid selector {:?}: {}", name, s, e))
            })
            .transpose()?;
        let pattern = rule
            .pattern
            .as_deref()
            .map(|p| Regex::new(p).map_err(|e| format!("field {}: invalid pattern: {}", name, e)))
            .transpose()?;
        if selector.is_none() && pattern.is_none() {
            return Err(format!("field {} needs a selector or a pattern", name));
        }
        Ok(Self {
            selector,
            attribute: rule.attribute.clone(),
            multiple: rule.multiple,
            pattern,
            prefix: rule.prefix.clone(),
        })
    }

    fn apply(&self, document: &Html, raw: &str) -> FieldValue {
        let mut values: Vec<String> = match self.selector {
            Some(ref selector) => document
                .select(selector)
                .filter_map(|el| self.read_element(el))
                .flat_map(|v| self.matches(&v))
                .collect(),
            None => self.matches(raw),
        };

        if let Some(ref prefix) = self.prefix {
            for value in &mut values {
                if !value.starts_with(prefix.as_str()) {
                    value.insert_str(0, prefix);
                }
            }
        }

        if self.multiple {
            let mut seen = BTreeSet::new();
            values.retain(|v| seen.insert(v.clone()));
            FieldValue::List(values)
        } else {
            FieldValue::Text(values.into_iter().next().unwrap_or_default())
        }
    }

    fn read_element(&self, el: ElementRef<'_>) -> Option<String> {
        let value = match self.attribute {
            Some(ref attr) => el.value().attr(attr)?.trim().to_string(),
            None => collapse_whitespace(&el.text().collect::<String>()),
        };
        (!value.is_empty()).then_some(value)
    }

    /// Values matched by the rule's pattern, or the input itself without one.
    fn matches(&self, input: &str) -> Vec<String> {
        let Some(ref pattern) = self.pattern else {
            return vec![input.to_string()];
        };
        let values = pattern.captures_iter(input).filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
        });
        if self.multiple {
            values.collect()
        } else {
            values.take(1).collect()
        }
    }
}

/// Maps field names to extraction rules.
pub struct DetailExtractor {
    rules: Vec<(String, CompiledRule)>,
}

impl DetailExtractor {
    pub fn new(rules: &BTreeMap<String, FieldRule>) -> Result<Self, String> {
        let rules = rules
            .iter()
            .map(|(name, rule)| Ok((name.clone(), CompiledRule::compile(name, rule)?)))
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { rules })
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(name, _)| name.as_str())
    }

    /// Extract every configured field. Missing markup yields empty values.
    pub fn extract(&self, id: &str, snapshot: &Snapshot) -> Record {
        let document = snapshot.document();
        let mut record = Record::new(id);
        for (name, rule) in &self.rules {
            record.set(name, rule.apply(&document, &snapshot.content));
        }
        record
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
