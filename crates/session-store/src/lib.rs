//! Durable store of resumable upload sessions.
//!
//! A session is the persisted projection of an in-progress upload: enough to
//! find it again when the same file is re-added after a restart, and to skip
//! the chunks the server already confirmed. Sessions are matched by
//! `(file_digest, file_size)` only.

mod file;
mod memory;
mod session;

use std::time::Duration;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use session::{UploadSession, now_millis};

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid session id: {0}")]
    InvalidId(String),
}

/// Keyed persistence of [`UploadSession`]s.
///
/// Implementations must tolerate concurrent calls from independent uploads:
/// writing one session never rewrites or corrupts another.
pub trait SessionStore: Send + Sync {
    /// Returns the session whose digest and size both match, if any.
    ///
    /// When several match, the most recently active one wins.
    fn find(&self, file_digest: &str, file_size: u64) -> Result<Option<UploadSession>, StoreError>;

    /// Inserts or replaces the session keyed by `session.id`.
    fn save(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// Removes the session with this id. Returns `true` if it existed.
    fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Returns every session that still has chunks outstanding, most recently
    /// active first.
    fn list_resumable(&self) -> Result<Vec<UploadSession>, StoreError>;

    /// Removes sessions whose last activity is before `cutoff_ms` (epoch
    /// milliseconds). Returns the number removed.
    fn clean_expired_before(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    /// Removes sessions idle for longer than `max_age`.
    fn clean_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        let age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        self.clean_expired_before(now_millis().saturating_sub(age_ms))
    }
}

/// Orders sessions most recently active first.
pub(crate) fn sort_by_activity(sessions: &mut [UploadSession]) {
    sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
}
