#![forbid(unsafe_code)]
//! Read-only integrity checking of cache metadata.
//!
//! Damage found while walking the structures is not an error in the
//! `Result` sense: it flows through per-structure damage visitors into an
//! [`ErrorState`] monoid, and only environmental failures (unreadable
//! path, I/O errors outside the format) surface as `Err`.

pub mod check;
pub mod error_state;
pub mod nested_output;

pub use check::{
    CheckOptions, CheckOutcome, check_succeeded, exit_code, metadata_check, run_cache_check,
};
pub use error_state::{ErrorState, combine_errors};
pub use nested_output::NestedOutput;
