//! Candidate files: the hand-off between `discover` and `run`.
//!
//! Accepted input is either one address per line or a CSV whose first
//! column holds the address, optionally under a `product_url`, `url` or `id`
//! header. Discovery writes the CSV form with a `url` header.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::checkpoint::csv;
use crate::models::WorkItem;

const HEADER_NAMES: [&str; 3] = ["product_url", "url", "id"];

/// Column name written by [`write_candidates`].
pub const CANDIDATE_HEADER: &str = "url";

/// Addresses from candidate file contents, in file order. Blank rows and a
/// recognised header row are skipped; duplicates are kept (dedup happens by id).
pub fn parse_candidates(text: &str) -> Vec<String> {
    let parsed = csv::parse_rows(text);
    let mut rows: Vec<Vec<String>> = parsed.rows;
    if let Some(tail) = parsed.partial {
        // A file without a trailing newline is still a complete file here.
        rows.extend(csv::parse_rows(&format!("{}\n", tail)).rows);
    }

    let mut out = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let Some(first) = row.first().map(|c| c.trim()) else {
            continue;
        };
        if first.is_empty() {
            continue;
        }
        if index == 0 && HEADER_NAMES.iter().any(|h| first.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push(first.to_string());
    }
    out
}

pub fn read_candidates(path: &Path) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_candidates(&text))
}

/// Write discovered items (their addresses) under a header row.
pub fn write_candidates(path: &Path, items: &[WorkItem]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut out = BufWriter::new(fs::File::create(path)?);
    csv::write_row(&mut out, &[CANDIDATE_HEADER])?;
    for item in items {
        csv::write_row(&mut out, &[item.payload.as_str()])?;
    }
    out.flush()
}
