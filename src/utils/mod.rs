//! Small shared helpers for the sync notifier crate.

pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}
