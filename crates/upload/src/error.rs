//! Upload error types.

use pixdrop_session_store::StoreError;
use pixdrop_transfer::TransferError;

use crate::api::ApiError;

/// Errors produced while uploading one item.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The file could not be read or hashed. Never retried automatically.
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("rate limited by server")]
    RateLimited,

    #[error("request rejected {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid server response: {0}")]
    InvalidResponse(String),

    /// The server confirmed fewer chunks than recorded locally; the server
    /// count wins.
    #[error("server confirmed {server} chunk(s), local state recorded {local}")]
    SessionMismatch { server: u32, local: u32 },

    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    ChunkExhausted {
        index: u32,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("server confirmed {confirmed} of {total} chunk(s) at completion")]
    IncompleteAtCompletion { confirmed: u32, total: u32 },

    #[error("no active upload session")]
    NoSession,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}

impl From<ApiError> for UploadError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(msg) => UploadError::Network(msg),
            ApiError::RateLimited { .. } => UploadError::RateLimited,
            ApiError::Server { status, body } => UploadError::Server { status, body },
            ApiError::Client { status, body } => UploadError::Rejected { status, body },
            ApiError::Decode(msg) => UploadError::InvalidResponse(msg),
        }
    }
}
