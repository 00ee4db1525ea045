//! Shared helpers.

mod hashing;
mod time;

pub use hashing::{content_hash, fact_hash, normalize_text, steps_hash};
pub use time::{from_millis, millis_ago, now_millis, opt_from_millis};
