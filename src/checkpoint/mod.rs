//! Durable per-item harvest state.
//!
//! The checkpoint is a CSV file with one row per upsert. Rows are appended
//! and synced before `upsert` returns; on load the last row for an id wins.
//! Opening a checkpoint compacts it to one row per id. New record fields add
//! columns (older rows read them as empty).

pub mod csv;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{FieldValue, Record, RecordSchema};

const COL_ID: &str = "id";
const COL_ATTEMPTS: &str = "attempts";
const COL_LAST_ERROR: &str = "last_error";
const COL_UPDATED_AT: &str = "updated_at";
const RESERVED: [&str; 4] = [COL_ID, COL_ATTEMPTS, COL_LAST_ERROR, COL_UPDATED_AT];

/// Separator between values of a list field inside one CSV cell.
pub const LIST_SEPARATOR: char = '|';

/// Checkpoint persistence errors. All of them are fatal to a run.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint {path} has an invalid header: {reason}")]
    Header { path: PathBuf, reason: String },
}

/// Persisted state of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub record: Record,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CheckpointEntry {
    fn new(id: &str) -> Self {
        Self {
            record: Record::new(id),
            attempts: 0,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Counts over a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub total: usize,
    pub complete: usize,
    pub incomplete: usize,
    /// Incomplete entries whose last attempt recorded an error.
    pub failed: usize,
}

struct Inner {
    entries: HashMap<String, CheckpointEntry>,
    /// Field columns after the reserved ones, in first-seen order.
    columns: Vec<String>,
    file: File,
}

/// Checkpoint file plus its in-memory view. Writes are serialized.
pub struct CheckpointStore {
    path: PathBuf,
    schema: RecordSchema,
    inner: Mutex<Inner>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint at `path`.
    ///
    /// A trailing row cut off by a crash, or any row with the wrong number of
    /// columns, is dropped with a warning.
    pub fn open(path: impl AsRef<Path>, schema: RecordSchema) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (entries, columns) = if path.exists() {
            let text = fs::read_to_string(&path)?;
            read_entries(&path, &text, &schema)?
        } else {
            (HashMap::new(), Vec::new())
        };

        let file = rewrite(&path, &entries, &columns, &schema)?;
        info!(
            "Opened checkpoint {} ({} entries)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            schema,
            inner: Mutex::new(Inner {
                entries,
                columns,
                file,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every entry.
    pub fn load(&self) -> HashMap<String, CheckpointEntry> {
        self.lock().entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<CheckpointEntry> {
        self.lock().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff an entry exists and its record has every required field.
    pub fn is_complete(&self, id: &str) -> bool {
        self.lock()
            .entries
            .get(id)
            .is_some_and(|e| e.record.is_complete(&self.schema))
    }

    /// Candidates that are not complete yet.
    pub fn pending<I, S>(&self, candidates: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inner = self.lock();
        let mut pending = BTreeSet::new();
        for candidate in candidates {
            let id: &str = candidate.as_ref();
            let complete = inner
                .entries
                .get(id)
                .is_some_and(|e| e.record.is_complete(&self.schema));
            if !complete {
                pending.insert(id.to_string());
            }
        }
        pending
    }

    /// Complete records, ordered by id.
    pub fn complete_records(&self) -> Vec<Record> {
        let inner = self.lock();
        let mut records: Vec<Record> = inner
            .entries
            .values()
            .filter(|e| e.record.is_complete(&self.schema))
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn summary(&self) -> CheckpointSummary {
        let inner = self.lock();
        let mut summary = CheckpointSummary {
            total: inner.entries.len(),
            ..Default::default()
        };
        for entry in inner.entries.values() {
            if entry.record.is_complete(&self.schema) {
                summary.complete += 1;
            } else {
                summary.incomplete += 1;
                if entry.last_error.is_some() {
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Merge `record` into its entry without overwriting non-empty fields.
    pub fn upsert(
        &self,
        record: &Record,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<CheckpointEntry, CheckpointError> {
        self.upsert_with(record, attempts, error, false)
    }

    /// Merge `record` into its entry, adding `attempts` to the stored count
    /// and recording `error` as the latest outcome. With `force`, non-empty
    /// incoming values replace existing ones; empty values never blank a field.
    ///
    /// The row is synced to disk before this returns.
    pub fn upsert_with(
        &self,
        record: &Record,
        attempts: u32,
        error: Option<&str>,
        force: bool,
    ) -> Result<CheckpointEntry, CheckpointError> {
        let mut inner = self.lock();

        let mut entry = inner
            .entries
            .get(&record.id)
            .cloned()
            .unwrap_or_else(|| CheckpointEntry::new(&record.id));
        entry.record.merge(record, force);
        entry.attempts = entry.attempts.saturating_add(attempts);
        entry.last_error = error.map(|e| e.to_string());
        entry.updated_at = Some(Utc::now());

        let mut added = false;
        for name in entry.record.fields.keys() {
            if RESERVED.contains(&name.as_str()) {
                warn!("Field {:?} collides with a checkpoint column; not persisted", name);
                continue;
            }
            if !inner.columns.contains(name) {
                inner.columns.push(name.clone());
                added = true;
            }
        }

        inner.entries.insert(entry.record.id.clone(), entry.clone());

        if added {
            debug!("New checkpoint columns; rewriting {}", self.path.display());
            let file = rewrite(&self.path, &inner.entries, &inner.columns, &self.schema)?;
            inner.file = file;
        } else {
            let row = csv::row_to_string(&to_row(&entry, &inner.columns, &self.schema));
            inner.file.write_all(row.as_bytes())?;
            inner.file.flush()?;
            inner.file.sync_data()?;
        }

        Ok(entry)
    }
}

fn header(columns: &[String]) -> Vec<String> {
    RESERVED
        .iter()
        .map(|s| s.to_string())
        .chain(columns.iter().cloned())
        .collect()
}

fn to_row(entry: &CheckpointEntry, columns: &[String], schema: &RecordSchema) -> Vec<String> {
    let mut row = vec![
        entry.record.id.clone(),
        entry.attempts.to_string(),
        entry.last_error.clone().unwrap_or_default(),
        entry.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
    ];
    for column in columns {
        let cell = match entry.record.get(column) {
            Some(value) if schema.is_list_field(column) => {
                value.joined(&LIST_SEPARATOR.to_string())
            }
            Some(value) => value.joined(" "),
            None => String::new(),
        };
        row.push(cell);
    }
    row
}

fn from_cell(column: &str, cell: &str, schema: &RecordSchema) -> FieldValue {
    if schema.is_list_field(column) {
        FieldValue::List(
            cell.split(LIST_SEPARATOR)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    } else {
        FieldValue::Text(cell.to_string())
    }
}

type Loaded = (HashMap<String, CheckpointEntry>, Vec<String>);

fn read_entries(path: &Path, text: &str, schema: &RecordSchema) -> Result<Loaded, CheckpointError> {
    let parsed = csv::parse_rows(text);
    if let Some(ref partial) = parsed.partial {
        warn!(
            "Dropping partially written row at end of {}: {:?}",
            path.display(),
            partial
        );
    }

    let mut rows = parsed.rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok((HashMap::new(), Vec::new()));
    };

    let position = |name: &str| header.iter().position(|h| h == name);
    let id_col = position(COL_ID).ok_or_else(|| CheckpointError::Header {
        path: path.to_path_buf(),
        reason: "missing id column".to_string(),
    })?;
    let attempts_col = position(COL_ATTEMPTS);
    let error_col = position(COL_LAST_ERROR);
    let updated_col = position(COL_UPDATED_AT);
    let field_cols: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .filter(|(_, h)| !RESERVED.contains(&h.as_str()) && !h.is_empty())
        .map(|(i, h)| (i, h.clone()))
        .collect();

    let mut entries = HashMap::new();
    for (line, row) in rows.enumerate() {
        if row.len() != header.len() {
            warn!(
                "Dropping malformed row {} in {} ({} columns, expected {})",
                line + 2,
                path.display(),
                row.len(),
                header.len()
            );
            continue;
        }
        let id = row[id_col].trim();
        if id.is_empty() {
            continue;
        }

        let mut entry = CheckpointEntry::new(id);
        entry.attempts = attempts_col
            .and_then(|i| row[i].trim().parse().ok())
            .unwrap_or(0);
        entry.last_error = error_col
            .map(|i| row[i].clone())
            .filter(|e| !e.is_empty());
        entry.updated_at = updated_col
            .and_then(|i| DateTime::parse_from_rfc3339(&row[i]).ok())
            .map(|t| t.with_timezone(&Utc));
        for (i, name) in &field_cols {
            entry.record.set(name, from_cell(name, &row[*i], schema));
        }

        // Last row wins: it already carries the merged state.
        entries.insert(id.to_string(), entry);
    }

    let columns = field_cols.into_iter().map(|(_, name)| name).collect();
    Ok((entries, columns))
}

/// Atomically replace the checkpoint with one row per entry and return an
/// append handle to the new file.
fn rewrite(
    path: &Path,
    entries: &HashMap<String, CheckpointEntry>,
    columns: &[String],
    schema: &RecordSchema,
) -> Result<File, CheckpointError> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = std::io::BufWriter::new(File::create(&tmp)?);
        csv::write_row(&mut out, &header(columns))?;

        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();
        for id in ids {
            csv::write_row(&mut out, &to_row(&entries[id], columns, schema))?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    Ok(OpenOptions::new().append(true).open(path)?)
}
