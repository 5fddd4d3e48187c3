//! Minimal CSV reading and writing for checkpoint files.
//!
//! Quotes, doubled-quote escapes, embedded newlines and CRLF are handled.
//! A final row that was cut off mid-write (no terminating newline, or an
//! unterminated quote) is reported separately so the caller can drop it.

use std::io::{self, Write};
use std::mem::take;

const SEP: char = ',';

/// Rows parsed from a checkpoint file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedRows {
    pub rows: Vec<Vec<String>>,
    /// Raw text of a trailing partial row, if any.
    pub partial: Option<String>,
}

/// Parse CSV text. Blank lines are skipped.
pub fn parse_rows(text: &str) -> ParsedRows {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut row_start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if matches!(chars.peek(), Some((_, '"'))) {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            c if c == SEP && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some((_, '\n'))) {
                    chars.next();
                }
                row.push(take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(take(&mut row));
                } else {
                    row.clear();
                }
                row_start = chars.peek().map(|(i, _)| *i).unwrap_or(text.len());
            }
            _ => field.push(ch),
        }
    }

    let tail = &text[row_start.min(text.len())..];
    let partial = (!tail.trim().is_empty()).then(|| tail.to_string());

    ParsedRows { rows, partial }
}

fn needs_quotes(field: &str) -> bool {
    field.contains(SEP)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r')
        || field.starts_with(' ')
        || field.ends_with(' ')
}

/// Write one row, newline-terminated.
pub fn write_row<W: Write, S: AsRef<str>>(mut w: W, row: &[S]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        let cell = cell.as_ref();
        if !first {
            write!(w, "{}", SEP)?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{}", cell)?;
        }
    }
    writeln!(w)
}

/// Serialize one row to a string, newline included.
pub fn row_to_string<S: AsRef<str>>(row: &[S]) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail.
    let _ = write_row(&mut buf, row);
    String::from_utf8_lossy(&buf).into_owned()
}
