//! Scripted in-memory upload server for tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pixdrop_protocol::{
    ChunkAck, ChunkHeader, InitUploadRequest, InitUploadResponse, ProbeRequest, RemoteFile,
    UploadStatusResponse,
};

use crate::api::{ApiError, ApiFuture, UploadApi};

type ChunkHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkCall {
    pub session_id: String,
    pub index: u32,
    pub digest: String,
    pub len: usize,
}

#[derive(Default)]
struct State {
    next_session: u32,
    /// Server-confirmed chunks per session.
    sessions: HashMap<String, BTreeSet<u32>>,
    init_requests: Vec<InitUploadRequest>,
    init_errors: VecDeque<ApiError>,
    chunk_calls: Vec<ChunkCall>,
    chunk_failures: HashMap<u32, VecDeque<ApiError>>,
    chunk_delay: Duration,
    /// Indices whose next upload is acknowledged without being recorded.
    lost_chunks: BTreeSet<u32>,
    on_chunk: Option<ChunkHook>,
    status_calls: Vec<String>,
    status_errors: VecDeque<ApiError>,
    status_count_only: bool,
    complete_calls: Vec<String>,
    cancel_calls: Vec<String>,
    cancel_error: Option<ApiError>,
    probe_requests: Vec<ProbeRequest>,
    probe_hit: Option<RemoteFile>,
    probe_error: Option<ApiError>,
    probe_delay: Duration,
}

/// In-memory server that records every call.
#[derive(Default)]
pub(crate) struct MockApi {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub(crate) fn remote_file(id: &str) -> RemoteFile {
    RemoteFile {
        id: id.into(),
        name: "photo.jpg".into(),
        url: format!("https://cdn.example.test/{id}"),
        size: 0,
        digest: String::new(),
        thumbnail_url: String::new(),
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    // -- scripting --

    /// Registers a server session that already holds `chunks`.
    pub fn seed_session(&self, session_id: &str, chunks: impl IntoIterator<Item = u32>) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(session_id.into(), chunks.into_iter().collect());
    }

    pub fn fail_init(&self, err: ApiError) {
        self.state.lock().unwrap().init_errors.push_back(err);
    }

    /// Queues failures returned by the next attempts of chunk `index`.
    pub fn fail_chunk(&self, index: u32, errors: impl IntoIterator<Item = ApiError>) {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .entry(index)
            .or_default()
            .extend(errors);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state.lock().unwrap().chunk_delay = delay;
    }

    /// The next upload of chunk `index` is acknowledged but not recorded.
    pub fn lose_chunk(&self, index: u32) {
        self.state.lock().unwrap().lost_chunks.insert(index);
    }

    pub fn on_chunk(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        self.state.lock().unwrap().on_chunk = Some(Arc::new(hook));
    }

    pub fn fail_status(&self, err: ApiError) {
        self.state.lock().unwrap().status_errors.push_back(err);
    }

    /// Status responses carry only the count, not the index list.
    pub fn set_status_count_only(&self) {
        self.state.lock().unwrap().status_count_only = true;
    }

    pub fn set_cancel_error(&self, err: ApiError) {
        self.state.lock().unwrap().cancel_error = Some(err);
    }

    pub fn set_probe_hit(&self, file: RemoteFile) {
        self.state.lock().unwrap().probe_hit = Some(file);
    }

    pub fn set_probe_error(&self, err: ApiError) {
        self.state.lock().unwrap().probe_error = Some(err);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.state.lock().unwrap().probe_delay = delay;
    }

    // -- inspection --

    pub fn chunk_calls(&self) -> Vec<ChunkCall> {
        self.state.lock().unwrap().chunk_calls.clone()
    }

    pub fn chunk_indices_sent(&self) -> Vec<u32> {
        self.chunk_calls().into_iter().map(|c| c.index).collect()
    }

    pub fn init_requests(&self) -> Vec<InitUploadRequest> {
        self.state.lock().unwrap().init_requests.clone()
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().status_calls.clone()
    }

    pub fn complete_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().complete_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().cancel_calls.clone()
    }

    pub fn probe_requests(&self) -> Vec<ProbeRequest> {
        self.state.lock().unwrap().probe_requests.clone()
    }

    pub fn confirmed(&self, session_id: &str) -> BTreeSet<u32> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn not_found(session_id: &str) -> ApiError {
    ApiError::Client {
        status: 404,
        body: format!("unknown session {session_id}"),
    }
}

impl UploadApi for MockApi {
    fn init<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.init_requests.push(req.clone());
            if let Some(err) = s.init_errors.pop_front() {
                return Err(err);
            }
            s.next_session += 1;
            let session_id = format!("srv-{}", s.next_session);
            s.sessions.insert(session_id.clone(), BTreeSet::new());
            Ok(InitUploadResponse { session_id })
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        data: &'a [u8],
    ) -> ApiFuture<'a, ChunkAck> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let (delay, hook) = {
                let mut s = self.state.lock().unwrap();
                s.chunk_calls.push(ChunkCall {
                    session_id: header.session_id.clone(),
                    index: header.chunk_index,
                    digest: header.chunk_digest.clone(),
                    len: data.len(),
                });
                (s.chunk_delay, s.on_chunk.clone())
            };
            if let Some(hook) = hook {
                hook(header.chunk_index);
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut s = self.state.lock().unwrap();
            if let Some(err) = s
                .chunk_failures
                .get_mut(&header.chunk_index)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }
            if pixdrop_transfer::digest_chunk(data) != header.chunk_digest {
                return Err(ApiError::Client {
                    status: 422,
                    body: "chunk digest mismatch".into(),
                });
            }
            let lost = s.lost_chunks.remove(&header.chunk_index);
            let Some(confirmed) = s.sessions.get_mut(&header.session_id) else {
                return Err(not_found(&header.session_id));
            };
            if !lost {
                confirmed.insert(header.chunk_index);
            }
            Ok(ChunkAck {
                session_id: header.session_id.clone(),
                chunk_index: header.chunk_index,
                uploaded_chunk_count: confirmed.len() as u32,
            })
        })
    }

    fn status<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, UploadStatusResponse> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.status_calls.push(session_id.to_string());
            if let Some(err) = s.status_errors.pop_front() {
                return Err(err);
            }
            let count_only = s.status_count_only;
            let confirmed = s.sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
            Ok(UploadStatusResponse {
                uploaded_chunk_count: confirmed.len() as u32,
                progress_percent: 0.0,
                uploaded_chunks: (!count_only).then(|| confirmed.iter().copied().collect()),
            })
        })
    }

    fn complete<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, RemoteFile> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.complete_calls.push(session_id.to_string());
            if s.sessions.remove(session_id).is_none() {
                return Err(not_found(session_id));
            }
            Ok(remote_file(&format!("file-{session_id}")))
        })
    }

    fn cancel<'a>(&'a self, session_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.cancel_calls.push(session_id.to_string());
            if let Some(err) = s.cancel_error.clone() {
                return Err(err);
            }
            s.sessions.remove(session_id);
            Ok(())
        })
    }

    fn probe_existing<'a>(&'a self, req: &'a ProbeRequest) -> ApiFuture<'a, Option<RemoteFile>> {
        Box::pin(async move {
            let delay = {
                let mut s = self.state.lock().unwrap();
                s.probe_requests.push(req.clone());
                s.probe_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let s = self.state.lock().unwrap();
            if let Some(err) = s.probe_error.clone() {
                return Err(err);
            }
            Ok(s.probe_hit.clone())
        })
    }
}
