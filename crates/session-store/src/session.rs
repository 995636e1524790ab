use pixdrop_protocol::DestinationOptions;
use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Persisted record of one in-progress upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Id of the upload item that owns the session (store key).
    pub id: String,
    /// Server-assigned session id.
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_digest: String,
    pub mime_type: String,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub uploaded_chunk_indices: Vec<u32>,
    #[serde(default)]
    pub destination_options: DestinationOptions,
    pub created_at: i64,
    pub last_activity_at: i64,
}

impl UploadSession {
    /// Returns `true` if this session belongs to content with this digest
    /// and size.
    pub fn matches(&self, file_digest: &str, file_size: u64) -> bool {
        self.file_digest == file_digest && self.file_size == file_size
    }

    /// Returns `true` while some chunk is still unconfirmed.
    pub fn is_resumable(&self) -> bool {
        (self.uploaded_chunk_indices.len() as u64) < self.total_chunks as u64
    }

    /// Fraction of chunks confirmed, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.uploaded_chunk_indices.len() as f64 / self.total_chunks as f64).min(1.0)
    }

    /// Returns `true` if the session was last active before `cutoff_ms`.
    pub fn is_expired(&self, cutoff_ms: i64) -> bool {
        self.last_activity_at < cutoff_ms
    }
}

#[cfg(test)]
pub(crate) fn sample_session(id: &str, digest: &str, size: u64) -> UploadSession {
    UploadSession {
        id: id.into(),
        session_id: format!("srv-{id}"),
        file_name: "photo.jpg".into(),
        file_size: size,
        file_digest: digest.into(),
        mime_type: "image/jpeg".into(),
        chunk_size_bytes: 4,
        total_chunks: size.div_ceil(4).max(1) as u32,
        uploaded_chunk_indices: Vec::new(),
        destination_options: DestinationOptions::default(),
        created_at: 1_000,
        last_activity_at: 1_000,
    }
}
