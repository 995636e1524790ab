use serde::{Deserialize, Serialize};

use crate::types::{DestinationOptions, RemoteFile, WatermarkOptions};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Starts a new server-side upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub size_bytes: u64,
    pub file_digest: String,
    pub mime_type: String,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub destination: DestinationOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkOptions>,
}

/// Metadata sent alongside the raw bytes of one chunk.
///
/// Chunk uploads are idempotent per `(session_id, chunk_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub session_id: String,
    pub chunk_index: u32,
    pub chunk_digest: String,
}

/// Asks whether content with this digest is already stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    pub file_digest: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub destination: DestinationOptions,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Acknowledges session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: String,
}

/// Acknowledges one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub session_id: String,
    pub chunk_index: u32,
    #[serde(default)]
    pub uploaded_chunk_count: u32,
}

/// Server-authoritative progress of a session.
///
/// Older servers only report the count; `uploaded_chunks` is used for exact
/// reconciliation when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub uploaded_chunk_count: u32,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_chunks: Option<Vec<u32>>,
}

/// Result of an instant-upload probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<RemoteFile>,
}

impl ProbeResponse {
    /// Returns the existing file on a hit.
    pub fn into_hit(self) -> Option<RemoteFile> {
        if self.exists { self.file } else { None }
    }
}
