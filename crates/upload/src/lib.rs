//! Client-side resumable chunked upload engine.
//!
//! The engine turns a local file into a remote one while surviving flaky
//! networks, app restarts and user intervention. It is transport-agnostic:
//! the application supplies an [`UploadApi`] implementation and a
//! [`SessionStore`](pixdrop_session_store::SessionStore).
//!
//! # Pipeline
//!
//! 1. **Analyze**: hash the whole file (SHA-256)
//! 2. **Probe**: ask the server whether identical content already exists
//! 3. **Prepare**: resume a stored session or create a new one
//! 4. **Upload**: send missing chunks in adaptive concurrent waves
//! 5. **Finalize**: verify server status and complete

pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod prober;
pub mod queue;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod mock;

pub use api::{ApiError, ApiFuture, UploadApi};
pub use backoff::{FailureClass, RetryPolicy};
pub use config::EngineConfig;
pub use error::UploadError;
pub use machine::{Effect, ItemEvent, transition};
pub use orchestrator::UploadOrchestrator;
pub use prober::InstantProber;
pub use queue::{ItemSnapshot, UploadHandle, UploadQueue};
pub use scheduler::{ChunkScheduler, SchedulerReport};
pub use types::{Control, SourceFile, UploadEvent, UploadItem, UploadState, detect_mime_type};
