//! Unique names for test databases.

use std::{
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;

/// Longest prefix for which generated names stay under PostgreSQL's 63 byte
/// identifier limit.
pub const MAX_PREFIX_LEN: usize = 20;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Builds `<prefix><unix nanos>_<pid>_<seq>`.
///
/// The per-process sequence keeps two calls that land on the same clock tick
/// apart.
pub fn generate(prefix: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let separator = if prefix.is_empty() || prefix.ends_with('_') {
        ""
    } else {
        "_"
    };
    format!("{prefix}{separator}{nanos}_{}_{seq}", process::id())
}
