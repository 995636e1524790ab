//! Wire types for the pixdrop chunked upload protocol.
//!
//! Every payload uses camelCase JSON field names so the same structs can be
//! shared by the HTTP binding and by test doubles.

pub mod messages;
pub mod types;

pub use messages::{
    ChunkAck, ChunkHeader, InitUploadRequest, InitUploadResponse, ProbeRequest, ProbeResponse,
    UploadStatusResponse,
};
pub use types::{DestinationOptions, ProcessingOptions, RemoteFile, Visibility, WatermarkOptions};
