use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::session::UploadSession;
use crate::{SessionStore, StoreError, sort_by_activity};

const EXTENSION: &str = "json";

/// Session store persisting one JSON file per session.
///
/// Files live at `<dir>/<id>.json`. Sessions are cached in memory and every
/// write touches only the file of the session being written, replaced
/// atomically through a temporary file and a rename.
pub struct FileSessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, UploadSession>>,
    tmp_seq: AtomicU64,
}

impl FileSessionStore {
    /// Opens (creating if needed) a store rooted at `dir`, loading every
    /// readable session file. Unreadable or corrupted files are skipped.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let sessions = load_sessions(&dir)?;
        debug!("loaded {} upload session(s) from {:?}", sessions.len(), dir);
        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Returns the directory this store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }
}

impl SessionStore for FileSessionStore {
    fn find(&self, file_digest: &str, file_size: u64) -> Result<Option<UploadSession>, StoreError> {
        let map = self.sessions.read().unwrap();
        Ok(map
            .values()
            .filter(|s| s.matches(file_digest, file_size))
            .max_by_key(|s| s.last_activity_at)
            .cloned())
    }

    fn save(&self, session: &UploadSession) -> Result<(), StoreError> {
        validate_id(&session.id)?;
        let json = serde_json::to_vec_pretty(session)?;

        // Each write gets its own temporary file, so the index lock is only
        // taken for the insert.
        let path = self.path_for(&session.id);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{EXTENSION}.{seq}.tmp"));
        std::fs::write(&tmp, &json)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.sessions
            .write()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        validate_id(id)?;
        let mut map = self.sessions.write().unwrap();
        let existed = map.remove(id).is_some();
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    fn list_resumable(&self) -> Result<Vec<UploadSession>, StoreError> {
        let mut list: Vec<UploadSession> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_resumable())
            .cloned()
            .collect();
        sort_by_activity(&mut list);
        Ok(list)
    }

    fn clean_expired_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut map = self.sessions.write().unwrap();
        let expired: Vec<String> = map
            .values()
            .filter(|s| s.is_expired(cutoff_ms))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            map.remove(id);
            if let Err(e) = std::fs::remove_file(self.path_for(id))
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(session = %id, error = %e, "failed to delete expired session file");
            }
        }
        if !expired.is_empty() {
            debug!("purged {} expired upload session(s)", expired.len());
        }
        Ok(expired.len())
    }
}

/// Loads every `*.json` session file in `dir`.
fn load_sessions(dir: &Path) -> Result<HashMap<String, UploadSession>, StoreError> {
    let mut sessions = HashMap::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(StoreError::from)
            .and_then(|data| serde_json::from_slice::<UploadSession>(&data).map_err(Into::into));
        match parsed {
            Ok(session) => {
                sessions.insert(session.id.clone(), session);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable session file");
            }
        }
    }
    Ok(sessions)
}

/// Session ids become file names, so only `[A-Za-z0-9_-]` is accepted.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
