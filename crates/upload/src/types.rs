//! Upload item, states, control signals and events.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use pixdrop_protocol::{DestinationOptions, InitUploadRequest, RemoteFile, WatermarkOptions};
use pixdrop_session_store::{UploadSession, now_millis};
use pixdrop_transfer::ChunkPlan;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::UploadError;

/// A local file queued for upload. Bytes are read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

impl SourceFile {
    /// Stats `path` and derives the display name and MIME type from it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();
        let meta = std::fs::metadata(&path)
            .map_err(|e| UploadError::AnalysisFailed(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(UploadError::AnalysisFailed(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = detect_mime_type(&path).to_string();
        Ok(Self {
            path,
            name,
            mime_type,
            size: meta.len(),
        })
    }
}

/// Detects a MIME type from a file extension.
///
/// Unknown extensions map to `application/octet-stream`.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("avif") => "image/avif",
        Some("heic") => "image/heic",
        Some("bmp") => "image/bmp",
        Some("tif" | "tiff") => "image/tiff",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Lifecycle state of an [`UploadItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadState {
    Pending,
    Analyzing,
    CheckingInstant,
    Preparing,
    Uploading,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    /// `Completed` and `Cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Cancelled)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Pending => "pending",
            UploadState::Analyzing => "analyzing",
            UploadState::CheckingInstant => "checking-instant",
            UploadState::Preparing => "preparing",
            UploadState::Uploading => "uploading",
            UploadState::Paused => "paused",
            UploadState::Retrying => "retrying",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// User intent for a running item, carried on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Run,
    Pause,
    Cancel,
}

/// One queued file and everything the engine knows about its upload.
///
/// Owned by a single driver task; other tasks influence it only through
/// [`Control`].
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub id: String,
    pub file: SourceFile,
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    pub file_digest: Option<String>,
    pub uploaded_chunk_indices: BTreeSet<u32>,
    pub failed_chunk_indices: BTreeSet<u32>,
    pub state: UploadState,
    pub session_id: Option<String>,
    /// When the current server session was created (epoch ms).
    pub session_created_at: Option<i64>,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub destination: DestinationOptions,
    pub watermark: Option<WatermarkOptions>,
    pub remote: Option<RemoteFile>,
    pub error: Option<String>,
    pub created_at: i64,
    /// Chunk digests computed so far, reused across attempts.
    pub chunk_digests: HashMap<u32, String>,
}

impl UploadItem {
    /// Creates a `Pending` item with a fresh id.
    pub fn new(
        file: SourceFile,
        config: &EngineConfig,
        destination: DestinationOptions,
        watermark: Option<WatermarkOptions>,
    ) -> Self {
        let plan = ChunkPlan::new(file.size, config.chunk_size_bytes);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            size_bytes: file.size,
            chunk_size_bytes: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
            file,
            file_digest: None,
            uploaded_chunk_indices: BTreeSet::new(),
            failed_chunk_indices: BTreeSet::new(),
            state: UploadState::Pending,
            session_id: None,
            session_created_at: None,
            speed_bytes_per_sec: 0.0,
            eta_seconds: None,
            retry_count: 0,
            max_retries: config.max_retries,
            destination,
            watermark,
            remote: None,
            error: None,
            created_at: now_millis(),
            chunk_digests: HashMap::new(),
        }
    }

    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan::new(self.size_bytes, self.chunk_size_bytes)
    }

    /// Indices not yet confirmed, ascending.
    pub fn pending_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunk_indices.contains(i))
            .collect()
    }

    pub fn is_fully_uploaded(&self) -> bool {
        self.uploaded_chunk_indices.len() as u64 >= self.total_chunks as u64
    }

    /// Records a confirmed chunk. Out-of-range indices are ignored.
    pub fn mark_uploaded(&mut self, index: u32) {
        if index < self.total_chunks {
            self.failed_chunk_indices.remove(&index);
            self.uploaded_chunk_indices.insert(index);
        }
    }

    /// Records a chunk whose latest attempt failed. Confirmed chunks stay
    /// confirmed.
    pub fn mark_failed(&mut self, index: u32) {
        if index < self.total_chunks && !self.uploaded_chunk_indices.contains(&index) {
            self.failed_chunk_indices.insert(index);
        }
    }

    /// Replaces the confirmed set, dropping out-of-range indices.
    pub fn set_uploaded(&mut self, indices: impl IntoIterator<Item = u32>) {
        let total = self.total_chunks;
        self.uploaded_chunk_indices = indices.into_iter().filter(|&i| i < total).collect();
        let uploaded = &self.uploaded_chunk_indices;
        self.failed_chunk_indices.retain(|i| !uploaded.contains(i));
    }

    /// Bytes still to transfer.
    pub fn remaining_bytes(&self) -> u64 {
        self.plan().bytes_for(self.pending_chunks())
    }

    /// Fraction of chunks confirmed.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.uploaded_chunk_indices.len() as f64 / self.total_chunks as f64
    }

    /// Session init payload. `None` until the digest is known.
    pub fn init_request(&self) -> Option<InitUploadRequest> {
        Some(InitUploadRequest {
            file_name: self.file.name.clone(),
            size_bytes: self.size_bytes,
            file_digest: self.file_digest.clone()?,
            mime_type: self.file.mime_type.clone(),
            chunk_size_bytes: self.chunk_size_bytes,
            total_chunks: self.total_chunks,
            destination: self.destination.clone(),
            watermark: self.watermark.clone(),
        })
    }

    /// Persisted projection of this item. `None` without a digest and a
    /// server session.
    pub fn to_session(&self, now: i64) -> Option<UploadSession> {
        Some(UploadSession {
            id: self.id.clone(),
            session_id: self.session_id.clone()?,
            file_name: self.file.name.clone(),
            file_size: self.size_bytes,
            file_digest: self.file_digest.clone()?,
            mime_type: self.file.mime_type.clone(),
            chunk_size_bytes: self.chunk_size_bytes,
            total_chunks: self.total_chunks,
            uploaded_chunk_indices: self.uploaded_chunk_indices.iter().copied().collect(),
            destination_options: self.destination.clone(),
            created_at: self.session_created_at.unwrap_or(now),
            last_activity_at: now,
        })
    }
}

/// Progress and lifecycle notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StateChanged {
        item_id: String,
        state: UploadState,
    },
    /// Hashing progress in `[0.0, 1.0]`.
    AnalysisProgress {
        item_id: String,
        fraction: f64,
    },
    /// One chunk was confirmed by the server.
    ChunkProgress {
        item_id: String,
        chunk_index: u32,
        uploaded_chunks: u32,
        total_chunks: u32,
        speed_bytes_per_sec: f64,
        eta_seconds: Option<f64>,
    },
    Completed {
        item_id: String,
        file: RemoteFile,
    },
    Failed {
        item_id: String,
        error: String,
        will_retry: bool,
    },
}

/// Non-blocking publisher for [`UploadEvent`]s.
///
/// Uploads never wait on a slow or absent consumer: when the channel is
/// full the event is dropped.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<UploadEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<UploadEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            trace!(?event, "event channel full, dropping event");
        }
    }
}

#[cfg(test)]
pub(crate) fn test_item(size: u64, chunk_size: u64) -> UploadItem {
    let config = EngineConfig {
        chunk_size_bytes: chunk_size,
        ..Default::default()
    };
    let file = SourceFile {
        path: PathBuf::from("/nonexistent/photo.jpg"),
        name: "photo.jpg".into(),
        mime_type: "image/jpeg".into(),
        size,
    };
    UploadItem::new(file, &config, DestinationOptions::default(), None)
}
