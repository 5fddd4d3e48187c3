//! Work items and their canonical identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::FailureKind;

/// One unit of harvesting work.
///
/// `id` is the dedup and resume key and is always derived from `payload`
/// through [`canonical_id`], so the same address yields the same id across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Address to visit for this item.
    pub payload: String,
}

impl WorkItem {
    /// Build a work item from an address, deriving its id.
    pub fn from_address(address: &str, rules: &IdRules) -> Result<Self, ItemError> {
        let payload = address.trim().to_string();
        let id = canonical_id(&payload, rules)?;
        Ok(Self { id, payload })
    }
}

/// Rules for deriving a canonical id from an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdRules {
    /// Drop query parameters (except those listed in `keep_query`).
    pub strip_query: bool,
    /// Query parameters that identify the item and must survive stripping.
    pub keep_query: Vec<String>,
    /// Drop `#fragment`.
    pub strip_fragment: bool,
    /// Lowercase the whole identifier.
    pub lowercase: bool,
    /// Remove a trailing `/` from non-root paths.
    pub trim_trailing_slash: bool,
}

impl Default for IdRules {
    fn default() -> Self {
        Self {
            strip_query: true,
            keep_query: Vec::new(),
            strip_fragment: true,
            lowercase: true,
            trim_trailing_slash: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("empty identifier")]
    Empty,
    #[error("malformed identifier: {0}")]
    Malformed(String),
}

impl ItemError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Terminal
    }
}

/// Derive the canonical id for an address.
///
/// Absolute http(s) URLs are normalized (query, fragment, case, trailing
/// slash); anything else must be a bare token without whitespace and is only
/// trimmed and optionally lowercased.
pub fn canonical_id(address: &str, rules: &IdRules) -> Result<String, ItemError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ItemError::Empty);
    }

    let id = match Url::parse(trimmed) {
        Ok(url) => canonical_url(url, rules)?,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            if trimmed.chars().any(char::is_whitespace) {
                return Err(ItemError::Malformed(trimmed.to_string()));
            }
            trimmed.to_string()
        }
        Err(e) => return Err(ItemError::Malformed(format!("{}: {}", trimmed, e))),
    };

    Ok(if rules.lowercase {
        id.to_lowercase()
    } else {
        id
    })
}

fn canonical_url(mut url: Url, rules: &IdRules) -> Result<String, ItemError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ItemError::Malformed(url.to_string()));
    }
    if url.host_str().is_none() {
        return Err(ItemError::Malformed(url.to_string()));
    }

    if rules.strip_fragment {
        url.set_fragment(None);
    }

    if rules.strip_query {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| rules.keep_query.iter().any(|keep| keep == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    if rules.trim_trailing_slash {
        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(path.trim_end_matches('/'));
        }
    }

    let mut out = url.to_string();
    // Url keeps a bare "/" path on the root; drop it so "https://a.com" == "https://a.com/".
    if rules.trim_trailing_slash && url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        out.truncate(out.trim_end_matches('/').len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_query_and_lowercases() {
        let rules = IdRules::default();
        let id = canonical_id(
            "https://www.Example.com/Shopping/Item-123.aspx?storeid=9&size=2#reviews",
            &rules,
        )
        .unwrap();
        assert_eq!(id, "https://www.example.com/shopping/item-123.aspx");
    }

    #[test]
    fn keeps_whitelisted_query_params() {
        let rules = IdRules {
            keep_query: vec!["sku".to_string()],
            ..Default::default()
        };
        let id = canonical_id("https://shop.test/p?ref=home&sku=AB12", &rules).unwrap();
        assert_eq!(id, "https://shop.test/p?sku=ab12");
    }

    #[test]
    fn trailing_slash_and_root_are_normalized() {
        let rules = IdRules::default();
        assert_eq!(
            canonical_id("https://shop.test/en/products/dress/", &rules).unwrap(),
            "https://shop.test/en/products/dress"
        );
        assert_eq!(
            canonical_id("https://shop.test/", &rules).unwrap(),
            canonical_id("https://shop.test", &rules).unwrap()
        );
    }

    #[test]
    fn bare_tokens_are_accepted() {
        let rules = IdRules::default();
        assert_eq!(canonical_id("  SKU-991 ", &rules).unwrap(), "sku-991");
    }

    #[test]
    fn malformed_input_is_rejected() {
        let rules = IdRules::default();
        assert_eq!(canonical_id("   ", &rules), Err(ItemError::Empty));
        assert!(matches!(
            canonical_id("not an id", &rules),
            Err(ItemError::Malformed(_))
        ));
        assert!(matches!(
            canonical_id("ftp://files.test/a", &rules),
            Err(ItemError::Malformed(_))
        ));
    }

    #[test]
    fn work_item_keeps_original_payload() {
        let item = WorkItem::from_address(" https://Shop.test/a?x=1 ", &IdRules::default()).unwrap();
        assert_eq!(item.payload, "https://Shop.test/a?x=1");
        assert_eq!(item.id, "https://shop.test/a");
    }
}
