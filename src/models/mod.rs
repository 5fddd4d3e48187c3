//! Data models for harvest runs.

mod record;
mod work_item;

pub use record::{FieldValue, Record, RecordSchema};
pub use work_item::{canonical_id, IdRules, ItemError, WorkItem};
