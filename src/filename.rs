//! Unique maildir basename generation
//!
//! Maildir publication relies on basenames never colliding across
//! concurrent writers, including external delivery agents sharing the same
//! directories. The classic recipe is time + per-process uniqueness + host;
//! a random UUID stands in for the per-process counter.

use std::env;

use chrono::Utc;
use uuid::Uuid;

/// Generate a unique maildir basename
///
/// Format: `<unix-secs>.<uuid>.<host>`. The result never contains `/`
/// or the `:` that starts a maildir info suffix, so it is safe in `tmp/`,
/// `new/`, and as the stem of a flagged `cur/` name.
pub fn generate() -> String {
    format!(
        "{}.{}.{}",
        Utc::now().timestamp(),
        Uuid::new_v4().simple(),
        hostname()
    )
}

/// Best-effort host label for generated basenames
///
/// `/` and `:` would corrupt the maildir name, so they are mapped away the
/// same way maildir delivery agents encode them.
fn hostname() -> String {
    let raw = env::var("HOSTNAME").unwrap_or_default();
    if raw.is_empty() {
        return "localhost".to_owned();
    }
    raw.replace('/', "\\057").replace(':', "\\072")
}
