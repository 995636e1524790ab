//! Upload orchestrator: drives items through the state machine.
//!
//! The orchestrator executes the [`Effect`]s returned by
//! [`transition`](crate::machine::transition) against the server, the
//! session store and the local file, feeding each result back as an
//! [`ItemEvent`] until the item settles (completed, cancelled, paused, or
//! failed with no retry pending).

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use pixdrop_protocol::{DestinationOptions, UploadStatusResponse, WatermarkOptions};
use pixdrop_session_store::{SessionStore, UploadSession, now_millis};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::UploadApi;
use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::machine::{Effect, ItemEvent, transition};
use crate::prober::InstantProber;
use crate::queue::ItemSnapshot;
use crate::scheduler::{ChunkScheduler, wait_for_stop};
use crate::types::{Control, EventSink, SourceFile, UploadEvent, UploadItem, UploadState};

/// Capacity of the event channel.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Session resolved by the prepare step.
struct PreparedSession {
    session_id: String,
    uploaded: Vec<u32>,
    created_at: i64,
}

/// Runs uploads against one server and one session store.
pub struct UploadOrchestrator {
    api: Arc<dyn UploadApi>,
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
    prober: InstantProber,
    events: EventSink,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl UploadOrchestrator {
    /// Creates an orchestrator. `config` is normalized once here.
    pub fn new(
        api: Arc<dyn UploadApi>,
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        let config = config.normalized();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            api,
            store,
            prober: InstantProber::new(config.probe_timeout()),
            config,
            events: EventSink::new(events_tx),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Creates a `Pending` item for `file` with the configured chunk size
    /// and retry budget.
    pub fn create_item(
        &self,
        file: SourceFile,
        destination: DestinationOptions,
        watermark: Option<WatermarkOptions>,
    ) -> UploadItem {
        UploadItem::new(file, &self.config, destination, watermark)
    }

    /// Starts a `Pending` item and drives it until it settles.
    pub async fn run(&self, item: UploadItem, control: &watch::Receiver<Control>) -> UploadItem {
        self.drive(item, ItemEvent::Start, control).await
    }

    /// Resumes a `Paused` item.
    pub async fn resume(&self, item: UploadItem, control: &watch::Receiver<Control>) -> UploadItem {
        self.drive(item, ItemEvent::Resume, control).await
    }

    /// Retries a `Failed` item with a fresh retry budget.
    pub async fn retry(&self, item: UploadItem, control: &watch::Receiver<Control>) -> UploadItem {
        self.drive(item, ItemEvent::ManualRetry, control).await
    }

    /// Cancels an item that is not currently being driven.
    pub async fn cancel(&self, item: UploadItem) -> UploadItem {
        let (_tx, control) = watch::channel(Control::Cancel);
        self.drive(item, ItemEvent::Cancel, &control).await
    }

    /// Removes sessions idle longer than the configured maximum age.
    pub fn clean_expired_sessions(&self) -> Result<usize, UploadError> {
        Ok(self.store.clean_expired(self.config.session_max_age())?)
    }

    /// Feeds `event` to the item and executes effects until it settles.
    pub async fn drive(
        &self,
        item: UploadItem,
        event: ItemEvent,
        control: &watch::Receiver<Control>,
    ) -> UploadItem {
        self.drive_observed(item, event, control, None).await
    }

    /// Like [`drive`](Self::drive), also publishing every state change on
    /// `observer`.
    pub(crate) async fn drive_observed(
        &self,
        mut item: UploadItem,
        event: ItemEvent,
        control: &watch::Receiver<Control>,
        observer: Option<&watch::Sender<ItemSnapshot>>,
    ) -> UploadItem {
        let mut pending: VecDeque<ItemEvent> = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let before = item.state;
            let (next, effects) = transition(item, event, &self.config);
            item = next;
            self.publish(&item, before, &effects, observer);

            for effect in effects {
                if let Some(interrupt) = interruption(&item, control) {
                    pending.clear();
                    pending.push_back(interrupt);
                    break;
                }
                if let Some(follow_up) = self.execute(&mut item, effect, control).await {
                    pending.push_back(follow_up);
                }
            }
        }
        item
    }

    fn publish(
        &self,
        item: &UploadItem,
        before: UploadState,
        effects: &[Effect],
        observer: Option<&watch::Sender<ItemSnapshot>>,
    ) {
        if item.state == before {
            return;
        }
        debug!(item = %item.id, from = %before, to = %item.state, "state changed");
        if let Some(observer) = observer {
            observer.send_replace(ItemSnapshot {
                state: item.state,
                settled: false,
            });
        }
        self.events.emit(UploadEvent::StateChanged {
            item_id: item.id.clone(),
            state: item.state,
        });

        match item.state {
            UploadState::Completed => {
                if let Some(file) = &item.remote {
                    info!(item = %item.id, name = %item.file.name, remote = %file.id, "upload completed");
                    self.events.emit(UploadEvent::Completed {
                        item_id: item.id.clone(),
                        file: file.clone(),
                    });
                }
            }
            UploadState::Failed => {
                let will_retry = effects
                    .iter()
                    .any(|e| matches!(e, Effect::ScheduleRetry(_)));
                let message = item.error.clone().unwrap_or_default();
                if will_retry {
                    warn!(item = %item.id, retry = item.retry_count, error = %message, "upload failed, retry scheduled");
                } else {
                    error!(item = %item.id, error = %message, "upload failed");
                }
                self.events.emit(UploadEvent::Failed {
                    item_id: item.id.clone(),
                    error: message,
                    will_retry,
                });
            }
            UploadState::Cancelled => {
                info!(item = %item.id, "upload cancelled");
            }
            _ => {}
        }
    }

    async fn execute(
        &self,
        item: &mut UploadItem,
        effect: Effect,
        control: &watch::Receiver<Control>,
    ) -> Option<ItemEvent> {
        match effect {
            Effect::Analyze => Some(self.analyze(item).await),
            Effect::Probe => {
                let Some(digest) = item.file_digest.as_deref() else {
                    return Some(ItemEvent::ProbeMiss);
                };
                let hit = self
                    .prober
                    .probe(self.api.as_ref(), digest, item.size_bytes, &item.destination)
                    .await;
                Some(match hit {
                    Some(file) => ItemEvent::ProbeHit(file),
                    None => ItemEvent::ProbeMiss,
                })
            }
            Effect::Prepare => Some(match self.prepare(item).await {
                Ok(prepared) => ItemEvent::SessionReady {
                    session_id: prepared.session_id,
                    uploaded: prepared.uploaded,
                    created_at: prepared.created_at,
                },
                Err(UploadError::AnalysisFailed(error)) => ItemEvent::AnalysisFailed { error },
                Err(e) => ItemEvent::PrepareFailed {
                    error: e.to_string(),
                },
            }),
            Effect::SyncStatus => Some(self.sync_status(item).await),
            Effect::Persist => {
                self.persist(item);
                None
            }
            Effect::Upload => Some(self.upload(item, control).await),
            Effect::Finalize => Some(self.finalize(item).await),
            Effect::NotifyCancel { session_id } => {
                if let Err(e) = self.api.cancel(&session_id).await {
                    warn!(item = %item.id, session = %session_id, error = %e, "failed to cancel server session");
                }
                None
            }
            Effect::RemoveSession => {
                if let Err(e) = self.store.remove(&item.id) {
                    warn!(item = %item.id, error = %e, "failed to remove stored session");
                }
                None
            }
            Effect::ScheduleRetry(delay) => {
                debug!(item = %item.id, delay_ms = delay.as_millis() as u64, "retry scheduled");
                let mut control = control.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Some(ItemEvent::RetryDue),
                    signal = wait_for_stop(&mut control) => match signal {
                        Control::Cancel => Some(ItemEvent::Cancel),
                        _ => None,
                    },
                }
            }
        }
    }

    async fn analyze(&self, item: &UploadItem) -> ItemEvent {
        let path = item.file.path.clone();
        let size = item.size_bytes;
        let events = self.events.clone();
        let item_id = item.id.clone();

        let result = tokio::task::spawn_blocking(move || {
            pixdrop_transfer::digest_file(&path, Some(size), &mut |fraction| {
                events.emit(UploadEvent::AnalysisProgress {
                    item_id: item_id.clone(),
                    fraction,
                });
            })
        })
        .await;

        match result {
            Ok(Ok(digest)) => {
                debug!(item = %item.id, digest = %digest, "file analyzed");
                ItemEvent::Analyzed { digest }
            }
            Ok(Err(e)) => ItemEvent::AnalysisFailed {
                error: UploadError::AnalysisFailed(e.to_string()).to_string(),
            },
            Err(e) => ItemEvent::AnalysisFailed {
                error: UploadError::AnalysisFailed(format!("hashing task failed: {e}")).to_string(),
            },
        }
    }

    /// Resumes the stored session for this content, or creates a new one.
    async fn prepare(&self, item: &UploadItem) -> Result<PreparedSession, UploadError> {
        let digest = item
            .file_digest
            .as_deref()
            .ok_or_else(|| UploadError::AnalysisFailed("file digest missing".into()))?;

        let stored = match self.store.find(digest, item.size_bytes) {
            Ok(found) => found,
            Err(e) => {
                warn!(item = %item.id, error = %e, "session lookup failed, starting fresh");
                None
            }
        };

        if let Some(session) = stored {
            if let Some(prepared) = self.resume_session(item, &session).await? {
                return Ok(prepared);
            }
        }

        let req = item
            .init_request()
            .ok_or_else(|| UploadError::AnalysisFailed("file digest missing".into()))?;
        let resp = self.api.init(&req).await?;
        info!(
            item = %item.id,
            session = %resp.session_id,
            chunks = item.total_chunks,
            "upload session created"
        );
        Ok(PreparedSession {
            session_id: resp.session_id,
            uploaded: Vec::new(),
            created_at: now_millis(),
        })
    }

    /// Adopts a stored session after checking it with the server.
    ///
    /// Returns `None` when the session cannot be reused; it is then removed
    /// from the store.
    async fn resume_session(
        &self,
        item: &UploadItem,
        session: &UploadSession,
    ) -> Result<Option<PreparedSession>, UploadError> {
        let compatible = session.chunk_size_bytes == item.chunk_size_bytes
            && session.total_chunks == item.total_chunks;
        if !compatible {
            debug!(item = %item.id, stored = %session.id, "stored session has a different chunk layout");
            self.forget_session(&session.id);
            return Ok(None);
        }

        let status = match self.api.status(&session.session_id).await {
            Ok(status) => status,
            Err(e) if e.is_session_gone() => {
                info!(item = %item.id, session = %session.session_id, "stored session expired on server");
                self.forget_session(&session.id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let local: BTreeSet<u32> = session
            .uploaded_chunk_indices
            .iter()
            .copied()
            .filter(|&i| i < item.total_chunks)
            .collect();
        let uploaded = reconcile(&item.id, &local, item.total_chunks, &status);

        // The session is re-keyed to this item on the next persist.
        if session.id != item.id {
            self.forget_session(&session.id);
        }

        info!(
            item = %item.id,
            session = %session.session_id,
            confirmed = uploaded.len(),
            total = item.total_chunks,
            "resuming upload session"
        );
        Ok(Some(PreparedSession {
            session_id: session.session_id.clone(),
            uploaded,
            created_at: session.created_at,
        }))
    }

    async fn sync_status(&self, item: &UploadItem) -> ItemEvent {
        let Some(session_id) = item.session_id.as_deref() else {
            return ItemEvent::SessionLost;
        };
        match self.api.status(session_id).await {
            Ok(status) => ItemEvent::StatusSynced {
                uploaded: reconcile(
                    &item.id,
                    &item.uploaded_chunk_indices,
                    item.total_chunks,
                    &status,
                ),
            },
            Err(e) if e.is_session_gone() => {
                warn!(item = %item.id, session = %session_id, "server session lost");
                ItemEvent::SessionLost
            }
            Err(e) => ItemEvent::UploadFailed {
                error: UploadError::from(e).to_string(),
            },
        }
    }

    async fn upload(&self, item: &mut UploadItem, control: &watch::Receiver<Control>) -> ItemEvent {
        let mut scheduler =
            ChunkScheduler::new(&self.config, Arc::clone(&self.store), self.events.clone());
        match scheduler.run(self.api.as_ref(), item, control).await {
            Ok(report) => match report.stopped {
                Some(Control::Cancel) => ItemEvent::Cancel,
                Some(Control::Pause) => ItemEvent::Pause,
                _ if item.is_fully_uploaded() => ItemEvent::ChunksUploaded,
                _ => ItemEvent::UploadFailed {
                    error: "chunk transfer stopped early".into(),
                },
            },
            Err(UploadError::AnalysisFailed(error)) => ItemEvent::AnalysisFailed { error },
            Err(UploadError::ChunkExhausted { source, .. }) if source.is_session_gone() => {
                ItemEvent::SessionLost
            }
            Err(e) => ItemEvent::UploadFailed {
                error: e.to_string(),
            },
        }
    }

    /// Re-verifies server status, then completes the upload.
    async fn finalize(&self, item: &UploadItem) -> ItemEvent {
        let Some(session_id) = item.session_id.as_deref() else {
            return ItemEvent::SessionLost;
        };

        let status = match self.api.status(session_id).await {
            Ok(status) => status,
            Err(e) if e.is_session_gone() => return ItemEvent::SessionLost,
            Err(e) => {
                return ItemEvent::UploadFailed {
                    error: UploadError::from(e).to_string(),
                };
            }
        };

        let confirmed = reconcile(
            &item.id,
            &item.uploaded_chunk_indices,
            item.total_chunks,
            &status,
        );
        if (confirmed.len() as u64) < item.total_chunks as u64 {
            let err = UploadError::IncompleteAtCompletion {
                confirmed: confirmed.len() as u32,
                total: item.total_chunks,
            };
            warn!(item = %item.id, session = %session_id, error = %err, "re-uploading missing chunks");
            return ItemEvent::Incomplete {
                uploaded: confirmed,
            };
        }

        match self.api.complete(session_id).await {
            Ok(file) => ItemEvent::Completed(file),
            Err(e) => ItemEvent::UploadFailed {
                error: UploadError::from(e).to_string(),
            },
        }
    }

    fn persist(&self, item: &UploadItem) {
        let Some(session) = item.to_session(now_millis()) else {
            return;
        };
        if let Err(e) = self.store.save(&session) {
            warn!(item = %item.id, error = %e, "failed to persist upload session");
        }
    }

    fn forget_session(&self, id: &str) {
        if let Err(e) = self.store.remove(id) {
            warn!(session = %id, error = %e, "failed to remove stored session");
        }
    }
}

/// Control signal that must preempt the remaining effects, if any.
fn interruption(item: &UploadItem, control: &watch::Receiver<Control>) -> Option<ItemEvent> {
    match *control.borrow() {
        Control::Cancel if !item.state.is_terminal() => Some(ItemEvent::Cancel),
        Control::Pause if matches!(item.state, UploadState::Uploading | UploadState::Retrying) => {
            Some(ItemEvent::Pause)
        }
        _ => None,
    }
}

/// Merges server status into the locally confirmed set. The server wins.
///
/// With an explicit index list, that list is the confirmed set. A bare count
/// lower than the local set cannot say which chunks are missing, so nothing
/// local is trusted and every chunk is sent again; chunk uploads are
/// idempotent per session and index.
fn reconcile(
    item_id: &str,
    local: &BTreeSet<u32>,
    total: u32,
    status: &UploadStatusResponse,
) -> Vec<u32> {
    let reconciled: Vec<u32> = match &status.uploaded_chunks {
        Some(indices) => {
            let set: BTreeSet<u32> = indices.iter().copied().filter(|&i| i < total).collect();
            set.into_iter().collect()
        }
        None if (status.uploaded_chunk_count as usize) < local.len() => Vec::new(),
        None => local.iter().copied().collect(),
    };

    if reconciled.len() < local.len() {
        let mismatch = UploadError::SessionMismatch {
            server: reconciled.len() as u32,
            local: local.len() as u32,
        };
        warn!(item = %item_id, error = %mismatch, "trusting server chunk status");
    }
    reconciled
}
