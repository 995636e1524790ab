//! Chunk scheduler: wave dispatch with adaptive concurrency and per-chunk
//! retry.
//!
//! The scheduler owns the item for the duration of a run. Chunk requests of
//! one wave are multiplexed on the calling task with `FuturesUnordered`, and
//! every response is folded into the item as it arrives: mark uploaded,
//! update speed and ETA, persist, publish progress.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use pixdrop_protocol::ChunkHeader;
use pixdrop_session_store::{SessionStore, now_millis};
use pixdrop_transfer::{ChunkPlan, SpeedEstimator, TransferError, digest_chunk, read_chunk};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiError, UploadApi};
use crate::backoff::RetryPolicy;
use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::types::{Control, EventSink, UploadEvent, UploadItem};

/// Summary of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerReport {
    /// Chunks confirmed during this run.
    pub uploaded_this_run: u32,
    /// Attempts made per chunk index.
    pub attempts: HashMap<u32, u32>,
    /// Concurrency after the last wave.
    pub final_concurrency: usize,
    /// Waves dispatched.
    pub waves: u32,
    /// Largest number of chunk requests outstanding at once.
    pub max_in_flight: usize,
    /// Set when a pause or cancel stopped the run early.
    pub stopped: Option<Control>,
}

enum ChunkResult {
    Confirmed { transfer_time: Duration },
    Exhausted(ApiError),
    Stopped(Control),
    Unreadable(TransferError),
}

struct ChunkOutcome {
    index: u32,
    bytes: u64,
    digest: Option<String>,
    attempts: u32,
    failed_attempts: u32,
    /// Wall time including retries.
    elapsed: Duration,
    result: ChunkResult,
}

/// Transfers the outstanding chunks of one item.
pub struct ChunkScheduler {
    config: EngineConfig,
    retry: RetryPolicy,
    current_concurrency: usize,
    failure_count: u32,
    speed: SpeedEstimator,
    store: Arc<dyn SessionStore>,
    events: EventSink,
}

impl ChunkScheduler {
    pub(crate) fn new(config: &EngineConfig, store: Arc<dyn SessionStore>, events: EventSink) -> Self {
        let config = config.clone().normalized();
        Self {
            retry: config.retry_policy(),
            current_concurrency: config.concurrency,
            failure_count: 0,
            speed: SpeedEstimator::new(),
            config,
            store,
            events,
        }
    }

    /// Current wave width.
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency
    }

    /// Uploads every chunk of `item` not yet confirmed.
    ///
    /// Returns early with `report.stopped` set when `control` leaves
    /// [`Control::Run`]; requests already in flight finish and only mark
    /// their own chunk. After a wave in which some chunk exhausted its
    /// retries, no further wave is dispatched and the error is returned.
    pub async fn run(
        &mut self,
        api: &dyn UploadApi,
        item: &mut UploadItem,
        control: &watch::Receiver<Control>,
    ) -> Result<SchedulerReport, UploadError> {
        let mut report = SchedulerReport {
            final_concurrency: self.current_concurrency,
            ..Default::default()
        };

        let pending = item.pending_chunks();
        if pending.is_empty() {
            return Ok(report);
        }
        let session_id = item.session_id.clone().ok_or(UploadError::NoSession)?;
        let plan = item.plan();
        let path = item.file.path.clone();
        let retry = self.retry.clone();
        let mut queue: VecDeque<u32> = pending.into();

        debug!(
            item = %item.id,
            session = %session_id,
            pending = queue.len(),
            concurrency = self.current_concurrency,
            "starting chunk transfer"
        );

        while !queue.is_empty() {
            let signal = *control.borrow();
            if signal != Control::Run {
                report.stopped = Some(signal);
                break;
            }

            let width = self.current_concurrency.min(queue.len());
            let wave: Vec<u32> = queue.drain(..width).collect();
            report.waves += 1;
            report.max_in_flight = report.max_in_flight.max(wave.len());
            for index in &wave {
                item.failed_chunk_indices.remove(index);
            }

            let mut in_flight: FuturesUnordered<_> = wave
                .iter()
                .map(|&index| {
                    send_chunk(
                        api,
                        ChunkJob {
                            path: path.clone(),
                            plan,
                            session_id: &session_id,
                            index,
                            memo: item.chunk_digests.get(&index).cloned(),
                        },
                        &retry,
                        control.clone(),
                    )
                })
                .collect();

            let mut wave_time = Duration::ZERO;
            let mut wave_confirmed = 0u32;
            let mut wave_failures = 0u32;
            let mut fatal: Option<UploadError> = None;

            while let Some(outcome) = in_flight.next().await {
                *report.attempts.entry(outcome.index).or_insert(0) += outcome.attempts;
                wave_failures += outcome.failed_attempts;
                if let Some(digest) = outcome.digest {
                    item.chunk_digests.insert(outcome.index, digest);
                }

                match outcome.result {
                    ChunkResult::Confirmed { transfer_time } => {
                        item.mark_uploaded(outcome.index);
                        report.uploaded_this_run += 1;
                        wave_confirmed += 1;
                        wave_time += outcome.elapsed;
                        self.record_progress(item, outcome.index, outcome.bytes, transfer_time);
                    }
                    ChunkResult::Exhausted(source) => {
                        item.mark_failed(outcome.index);
                        warn!(
                            item = %item.id,
                            chunk = outcome.index,
                            attempts = outcome.attempts,
                            error = %source,
                            "chunk retries exhausted"
                        );
                        fatal.get_or_insert(UploadError::ChunkExhausted {
                            index: outcome.index,
                            attempts: outcome.attempts,
                            source,
                        });
                    }
                    ChunkResult::Stopped(signal) => {
                        report.stopped.get_or_insert(signal);
                    }
                    ChunkResult::Unreadable(e) => {
                        item.mark_failed(outcome.index);
                        fatal.get_or_insert(UploadError::AnalysisFailed(format!(
                            "reading chunk {}: {e}",
                            outcome.index
                        )));
                    }
                }
            }

            self.adapt(wave_confirmed, wave_time, wave_failures);
            report.final_concurrency = self.current_concurrency;

            if let Some(err) = fatal {
                return Err(err);
            }
            if report.stopped.is_some() {
                break;
            }
            if !queue.is_empty() {
                tokio::time::sleep(self.config.inter_wave_delay()).await;
            }
        }

        debug!(
            item = %item.id,
            uploaded = report.uploaded_this_run,
            waves = report.waves,
            concurrency = report.final_concurrency,
            stopped = ?report.stopped,
            "chunk transfer finished"
        );
        Ok(report)
    }

    /// Folds one confirmed chunk into speed, ETA, the store and the event
    /// stream.
    fn record_progress(
        &mut self,
        item: &mut UploadItem,
        index: u32,
        bytes: u64,
        transfer_time: Duration,
    ) {
        item.speed_bytes_per_sec = self.speed.record(bytes, transfer_time);
        item.eta_seconds = self.speed.eta_seconds(item.remaining_bytes());

        if let Some(session) = item.to_session(now_millis())
            && let Err(e) = self.store.save(&session)
        {
            warn!(item = %item.id, chunk = index, error = %e, "failed to persist upload progress");
        }

        self.events.emit(UploadEvent::ChunkProgress {
            item_id: item.id.clone(),
            chunk_index: index,
            uploaded_chunks: item.uploaded_chunk_indices.len() as u32,
            total_chunks: item.total_chunks,
            speed_bytes_per_sec: item.speed_bytes_per_sec,
            eta_seconds: item.eta_seconds,
        });
    }

    /// Adjusts the wave width after a wave.
    ///
    /// Failed attempts accumulate across waves; once they exceed the
    /// threshold the width is halved and the counter reset. Otherwise the
    /// average wall time of confirmed chunks shrinks or grows the width by
    /// one.
    fn adapt(&mut self, confirmed: u32, wave_time: Duration, failures: u32) {
        let before = self.current_concurrency;
        self.failure_count += failures;

        if self.failure_count > self.config.wave_failure_threshold {
            self.current_concurrency = (self.current_concurrency / 2).max(1);
            self.failure_count = 0;
        } else if confirmed > 0 {
            let avg = wave_time / confirmed;
            if avg > Duration::from_millis(self.config.slow_wave_ms) {
                self.current_concurrency = self.current_concurrency.saturating_sub(1).max(1);
            } else if avg < Duration::from_millis(self.config.fast_wave_ms) {
                self.current_concurrency =
                    (self.current_concurrency + 1).min(self.config.max_concurrency);
            }
        }

        if self.current_concurrency != before {
            debug!(
                from = before,
                to = self.current_concurrency,
                "adjusted chunk concurrency"
            );
        }
    }
}

struct ChunkJob<'a> {
    path: PathBuf,
    plan: ChunkPlan,
    session_id: &'a str,
    index: u32,
    memo: Option<String>,
}

/// Reads, digests and sends one chunk, retrying transient failures.
async fn send_chunk(
    api: &dyn UploadApi,
    job: ChunkJob<'_>,
    retry: &RetryPolicy,
    mut control: watch::Receiver<Control>,
) -> ChunkOutcome {
    let started = Instant::now();
    let index = job.index;
    let mut outcome = ChunkOutcome {
        index,
        bytes: job.plan.len(index),
        digest: None,
        attempts: 0,
        failed_attempts: 0,
        elapsed: Duration::ZERO,
        result: ChunkResult::Stopped(Control::Run),
    };

    let signal = *control.borrow_and_update();
    if signal != Control::Run {
        outcome.result = ChunkResult::Stopped(signal);
        return outcome;
    }

    let ChunkJob {
        path, plan, memo, ..
    } = job;
    let read = tokio::task::spawn_blocking(move || {
        let chunk = read_chunk(&path, plan, index)?;
        let digest = memo.unwrap_or_else(|| digest_chunk(&chunk.data));
        Ok::<_, TransferError>((chunk, digest))
    })
    .await
    .unwrap_or_else(|e| Err(TransferError::Io(std::io::Error::other(e.to_string()))));

    let (chunk, digest) = match read {
        Ok(read) => read,
        Err(e) => {
            outcome.result = ChunkResult::Unreadable(e);
            outcome.elapsed = started.elapsed();
            return outcome;
        }
    };

    let header = ChunkHeader {
        session_id: job.session_id.to_string(),
        chunk_index: index,
        chunk_digest: digest.clone(),
    };
    outcome.digest = Some(digest);

    loop {
        outcome.attempts += 1;
        let attempt_started = Instant::now();
        match api.upload_chunk(&header, &chunk.data).await {
            Ok(_) => {
                outcome.result = ChunkResult::Confirmed {
                    transfer_time: attempt_started.elapsed(),
                };
                break;
            }
            Err(e) => {
                outcome.failed_attempts += 1;
                let class = e.class();
                if !retry.should_retry(outcome.failed_attempts, class) {
                    outcome.result = ChunkResult::Exhausted(e);
                    break;
                }
                let delay = retry.delay_for(outcome.failed_attempts, class);
                debug!(
                    chunk = index,
                    attempt = outcome.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "chunk upload failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    signal = wait_for_stop(&mut control) => {
                        outcome.result = ChunkResult::Stopped(signal);
                        break;
                    }
                }
            }
        }
    }

    outcome.elapsed = started.elapsed();
    outcome
}

/// Resolves once `control` leaves [`Control::Run`]. Never resolves if the
/// sender is gone.
pub(crate) async fn wait_for_stop(control: &mut watch::Receiver<Control>) -> Control {
    loop {
        let signal = *control.borrow_and_update();
        if signal != Control::Run {
            return signal;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
