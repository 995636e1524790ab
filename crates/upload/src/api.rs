//! Upload server trait.
//!
//! `UploadApi` is implemented by the transport layer (the HTTP client in
//! `pixdrop-http-api`). Keeping it a trait decouples the engine from the
//! wire and lets tests script server behavior.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use pixdrop_protocol::{
    ChunkAck, ChunkHeader, InitUploadRequest, InitUploadResponse, ProbeRequest, RemoteFile,
    UploadStatusResponse,
};

use crate::backoff::FailureClass;

/// Boxed future returned by [`UploadApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Errors reported by an [`UploadApi`] implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Transport failure: connect, reset, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// HTTP 4xx other than 429. Never retried.
    #[error("request rejected {status}: {body}")]
    Client { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Backoff class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            ApiError::Network(_) => FailureClass::Network,
            ApiError::RateLimited { retry_after } => FailureClass::RateLimited {
                retry_after: *retry_after,
            },
            ApiError::Server { .. } => FailureClass::Server,
            ApiError::Client { .. } | ApiError::Decode(_) => FailureClass::Fatal,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.class(), FailureClass::Fatal)
    }

    /// Whether the server no longer knows the session (404/410).
    pub fn is_session_gone(&self) -> bool {
        matches!(self, ApiError::Client { status: 404 | 410, .. })
    }
}

/// The upload protocol consumed by the engine.
pub trait UploadApi: Send + Sync {
    /// Creates a server session for one file.
    fn init<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse>;

    /// Sends one chunk. Idempotent per `(session_id, chunk_index)`.
    fn upload_chunk<'a>(&'a self, header: &'a ChunkHeader, data: &'a [u8])
    -> ApiFuture<'a, ChunkAck>;

    /// Returns the server-confirmed progress of a session.
    fn status<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, UploadStatusResponse>;

    /// Assembles the file once every chunk is confirmed.
    fn complete<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, RemoteFile>;

    /// Discards a session and its chunks.
    fn cancel<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, ()>;

    /// Looks up existing content by digest; `None` on a miss.
    fn probe_existing<'a>(&'a self, req: &'a ProbeRequest) -> ApiFuture<'a, Option<RemoteFile>>;
}
