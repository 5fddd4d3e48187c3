//! Command-line interface.

mod commands;
mod helpers;
pub mod progress;

pub use commands::{is_verbose, run, EXIT_CANCELLED, EXIT_INCOMPLETE};
