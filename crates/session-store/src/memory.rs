use std::collections::HashMap;
use std::sync::RwLock;

use crate::session::UploadSession;
use crate::{SessionStore, StoreError, sort_by_activity};

/// Non-durable session store backed by a map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, UploadSession>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the session stored under `id`.
    pub fn get(&self, id: &str) -> Option<UploadSession> {
        self.sessions.read().unwrap().get(id).cloned()
    }
}

impl SessionStore for MemorySessionStore {
    fn find(&self, file_digest: &str, file_size: u64) -> Result<Option<UploadSession>, StoreError> {
        let map = self.sessions.read().unwrap();
        Ok(map
            .values()
            .filter(|s| s.matches(file_digest, file_size))
            .max_by_key(|s| s.last_activity_at)
            .cloned())
    }

    fn save(&self, session: &UploadSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().unwrap().remove(id).is_some())
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
        let before = map.len();
        map.retain(|_, s| !s.is_expired(cutoff_ms));
        Ok(before - map.len())
    }
}
