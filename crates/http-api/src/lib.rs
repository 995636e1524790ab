//! HTTP implementation of [`UploadApi`].
//!
//! Async client using `reqwest` with optional Bearer token authentication.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | init      | `POST {base}/upload/init` (JSON) |
//! | chunk     | `POST {base}/upload/chunk` (octet-stream, `X-Session-Id`, `X-Chunk-Index`, `X-Chunk-Digest`) |
//! | status    | `GET {base}/upload/{session}/status` |
//! | complete  | `POST {base}/upload/{session}/complete` |
//! | cancel    | `DELETE {base}/upload/{session}` |
//! | probe     | `POST {base}/upload/probe` (404 is a miss) |

use std::time::Duration;

use pixdrop_protocol::{
    ChunkAck, ChunkHeader, InitUploadRequest, InitUploadResponse, ProbeRequest, ProbeResponse,
    RemoteFile, UploadStatusResponse,
};
use pixdrop_upload::{ApiError, ApiFuture, UploadApi};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

pub const SESSION_ID_HEADER: &str = "X-Session-Id";
pub const CHUNK_INDEX_HEADER: &str = "X-Chunk-Index";
pub const CHUNK_DIGEST_HEADER: &str = "X-Chunk-Digest";

/// Errors building the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API token")]
    InvalidToken,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Upload server reached over HTTP.
pub struct HttpUploadApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    /// Creates a client for `base_url`. Every request is bounded by
    /// `timeout`; a timeout surfaces as a network error.
    pub fn new(
        base_url: &str,
        api_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = api_token.filter(|t| !t.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ClientError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let body = send(req).await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Sends `req` and maps non-success statuses onto [`ApiError`].
async fn send(req: RequestBuilder) -> Result<Vec<u8>, ApiError> {
    let resp = req
        .send()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;
    let status = resp.status();
    trace!(status = status.as_u16(), url = %resp.url(), "response received");

    if status.is_success() {
        let body = resp
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        return Ok(body.to_vec());
    }

    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, body, retry_after))
}

/// Maps an HTTP error status onto the engine's error classes.
fn status_error(status: StatusCode, body: String, retry_after: Option<Duration>) -> ApiError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ApiError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        ApiError::Server {
            status: status.as_u16(),
            body,
        }
    } else {
        ApiError::Client {
            status: status.as_u16(),
            body,
        }
    }
}

/// Parses a `Retry-After` value given in seconds. HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

impl UploadApi for HttpUploadApi {
    fn init<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse> {
        Box::pin(async move {
            debug!(file = %req.file_name, chunks = req.total_chunks, "init upload");
            self.send_json(self.http.post(self.url("/upload/init")).json(req))
                .await
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> ApiFuture<'a, ChunkAck> {
        Box::pin(async move {
            let req = self
                .http
                .post(self.url("/upload/chunk"))
                .header(SESSION_ID_HEADER, &header.session_id)
                .header(CHUNK_INDEX_HEADER, header.chunk_index.to_string())
                .header(CHUNK_DIGEST_HEADER, &header.chunk_digest)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(data.to_vec());
            self.send_json(req).await
        })
    }

    fn status<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, UploadStatusResponse> {
        Box::pin(async move {
            self.send_json(self.http.get(self.url(&format!("/upload/{session_id}/status"))))
                .await
        })
    }

    fn complete<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, RemoteFile> {
        Box::pin(async move {
            self.send_json(
                self.http
                    .post(self.url(&format!("/upload/{session_id}/complete"))),
            )
            .await
        })
    }

    fn cancel<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            send(self.http.delete(self.url(&format!("/upload/{session_id}"))))
                .await
                .map(|_| ())
        })
    }

    fn probe_existing<'a>(&'a self, req: &'a ProbeRequest) -> ApiFuture<'a, Option<RemoteFile>> {
        Box::pin(async move {
            let resp: Result<ProbeResponse, ApiError> = self
                .send_json(self.http.post(self.url("/upload/probe")).json(req))
                .await;
            match resp {
                Ok(resp) => Ok(resp.into_hit()),
                Err(ApiError::Client { status: 404, .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }
}
