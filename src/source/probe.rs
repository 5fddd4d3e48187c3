//! Progress probes: read "how much is loaded" from a snapshot.

use regex::Regex;
use scraper::{ElementRef, Selector};

use super::Snapshot;

/// Loaded/total reading taken from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    Counted { observed: u64, total: Option<u64> },
    /// The signal is not on the page (markup changed, locale differs, ...).
    NotFound,
}

impl ProgressSignal {
    pub fn observed(&self) -> Option<u64> {
        match self {
            ProgressSignal::Counted { observed, .. } => Some(*observed),
            ProgressSignal::NotFound => None,
        }
    }
}

/// Reads a progress signal from a snapshot. Never fails: a missing signal
/// is reported as [`ProgressSignal::NotFound`].
pub trait ProgressProbe: Send + Sync {
    fn read(&self, snapshot: &Snapshot) -> ProgressSignal;
}

/// Parses "X of Y" style counters ("You've viewed 72 of 1,204 products").
pub struct CounterProbe {
    scope: Option<Selector>,
    pattern: Regex,
}

impl CounterProbe {
    pub const DEFAULT_PATTERN: &'static str = r"(?i)(\d[\d,.]*)\s+of\s+(\d[\d,.]*)";

    /// `scope` limits the search to matching elements' text; `None` searches
    /// the whole document. The pattern must capture observed then total.
    pub fn new(scope: Option<&str>, pattern: Option<&str>) -> Result<Self, String> {
        let scope = scope
            .map(|s| Selector::parse(s).map_err(|e| format!("invalid selector {:?}: {}", s, e)))
            .transpose()?;
        let pattern = Regex::new(pattern.unwrap_or(Self::DEFAULT_PATTERN))
            .map_err(|e| format!("invalid counter pattern: {}", e))?;
        if pattern.captures_len() < 3 {
            return Err("counter pattern needs two capture groups".to_string());
        }
        Ok(Self { scope, pattern })
    }

    fn parse_in(&self, text: &str) -> Option<(u64, u64)> {
        let caps = self.pattern.captures(text)?;
        let observed = parse_count(caps.get(1)?.as_str())?;
        let total = parse_count(caps.get(2)?.as_str())?;
        Some((observed, total))
    }
}

impl ProgressProbe for CounterProbe {
    fn read(&self, snapshot: &Snapshot) -> ProgressSignal {
        let document = snapshot.document();
        let texts: Vec<String> = match &self.scope {
            Some(selector) => document.select(selector).map(element_text).collect(),
            None => vec![element_text(document.root_element())],
        };

        texts
            .iter()
            .find_map(|t| self.parse_in(t))
            .map(|(observed, total)| ProgressSignal::Counted {
                observed,
                total: Some(total),
            })
            .unwrap_or(ProgressSignal::NotFound)
    }
}

/// Counts rendered items; the total is unknown.
pub struct ElementCountProbe {
    selector: Selector,
}

impl ElementCountProbe {
    pub fn new(selector: &str) -> Result<Self, String> {
        let selector = Selector::parse(selector)
            .map_err(|e| format!("invalid selector {:?}: {}", selector, e))?;
        Ok(Self { selector })
    }
}

impl ProgressProbe for ElementCountProbe {
    fn read(&self, snapshot: &Snapshot) -> ProgressSignal {
        let count = snapshot.document().select(&self.selector).count() as u64;
        if count == 0 {
            ProgressSignal::NotFound
        } else {
            ProgressSignal::Counted {
                observed: count,
                total: None,
            }
        }
    }
}

/// Tries probes in order and returns the first signal found.
pub struct FirstOf(pub Vec<Box<dyn ProgressProbe>>);

impl ProgressProbe for FirstOf {
    fn read(&self, snapshot: &Snapshot) -> ProgressSignal {
        self.0
            .iter()
            .map(|p| p.read(snapshot))
            .find(|s| *s != ProgressSignal::NotFound)
            .unwrap_or(ProgressSignal::NotFound)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}
