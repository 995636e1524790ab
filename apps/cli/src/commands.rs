//! Subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pixdrop_http_api::HttpUploadApi;
use pixdrop_protocol::{DestinationOptions, WatermarkOptions};
use pixdrop_session_store::{FileSessionStore, SessionStore, UploadSession};
use pixdrop_upload::{
    SourceFile, UploadEvent, UploadHandle, UploadItem, UploadOrchestrator, UploadQueue,
    UploadState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Outcome of one `upload` invocation.
#[derive(Debug, Default)]
pub struct UploadSummary {
    pub completed: usize,
    pub paused: usize,
    pub failed: usize,
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<FileSessionStore>> {
    let dir = config.session_dir()?;
    let store = FileSessionStore::open(&dir)
        .with_context(|| format!("opening session store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

/// Uploads `files`, resuming any stored sessions for the same content.
///
/// Ctrl-C pauses every running upload; sessions stay in the store so the
/// next run resumes where this one stopped.
pub async fn upload(
    config: &AppConfig,
    files: Vec<PathBuf>,
    destination: DestinationOptions,
    watermark: Option<WatermarkOptions>,
) -> anyhow::Result<UploadSummary> {
    let api = HttpUploadApi::new(
        &config.server_url,
        config.api_token(),
        config.request_timeout(),
    )
    .context("building HTTP client")?;
    let store = open_store(config)?;

    let mut orchestrator = UploadOrchestrator::new(Arc::new(api), store, config.engine.clone());
    match orchestrator.clean_expired_sessions() {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "purged expired sessions"),
        Err(e) => warn!(error = %e, "session cleanup failed"),
    }
    let events = orchestrator.take_events();
    let printer = events.map(|rx| tokio::spawn(log_events(rx)));

    let queue = UploadQueue::new(Arc::new(orchestrator));
    let mut summary = UploadSummary::default();
    let mut handles: Vec<UploadHandle> = Vec::new();
    for path in files {
        match SourceFile::open(&path) {
            Ok(file) => {
                let item = queue
                    .orchestrator()
                    .create_item(file, destination.clone(), watermark.clone());
                info!(item = %item.id, file = %item.file.name, size = item.size_bytes, "queued");
                handles.push(queue.enqueue(item));
            }
            Err(e) => {
                eprintln!("skipping {}: {e}", path.display());
                summary.failed += 1;
            }
        }
    }

    tokio::select! {
        _ = settle_all(&handles) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing uploads");
            for handle in &handles {
                handle.pause();
            }
            settle_all(&handles).await;
        }
    }
    queue.shutdown();

    for handle in handles {
        let item = handle.join().await.context("upload task panicked")?;
        report(&item, &mut summary);
    }

    drop(queue);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(summary)
}

async fn settle_all(handles: &[UploadHandle]) {
    for handle in handles {
        handle.settled().await;
    }
}

fn report(item: &UploadItem, summary: &mut UploadSummary) {
    match item.state {
        UploadState::Completed => {
            summary.completed += 1;
            let url = item.remote.as_ref().map(|f| f.url.as_str()).unwrap_or("");
            println!("done     {}  {url}", item.file.name);
        }
        UploadState::Paused | UploadState::Pending => {
            summary.paused += 1;
            println!(
                "paused   {}  {}/{} chunks",
                item.file.name,
                item.uploaded_chunk_indices.len(),
                item.total_chunks
            );
        }
        _ => {
            summary.failed += 1;
            println!(
                "failed   {}  {}",
                item.file.name,
                item.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

async fn log_events(mut rx: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::StateChanged { item_id, state } => {
                debug!(item = %item_id, %state, "state");
            }
            UploadEvent::AnalysisProgress { item_id, fraction } => {
                debug!(item = %item_id, percent = (fraction * 100.0).round(), "hashing");
            }
            UploadEvent::ChunkProgress {
                item_id,
                uploaded_chunks,
                total_chunks,
                speed_bytes_per_sec,
                eta_seconds,
                ..
            } => {
                info!(
                    item = %item_id,
                    chunks = %format!("{uploaded_chunks}/{total_chunks}"),
                    kib_per_sec = (speed_bytes_per_sec / 1024.0).round(),
                    eta_secs = eta_seconds.map(|s| s.round()),
                    "uploading"
                );
            }
            UploadEvent::Completed { item_id, file } => {
                info!(item = %item_id, remote = %file.id, url = %file.url, "completed");
            }
            UploadEvent::Failed {
                item_id,
                error,
                will_retry,
            } => {
                warn!(item = %item_id, %error, will_retry, "failed");
            }
        }
    }
}

/// Prints resumable sessions, most recent first.
pub fn list_sessions(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let sessions = store.list_resumable()?;
    if sessions.is_empty() {
        println!("no resumable sessions");
        return Ok(());
    }
    for session in &sessions {
        println!("{}", describe(session));
    }
    Ok(())
}

fn describe(session: &UploadSession) -> String {
    let last_active = chrono::DateTime::from_timestamp_millis(session.last_activity_at)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into());
    format!(
        "{}  {}  {}/{} chunks ({:.0}%)  last active {last_active}",
        session.id,
        session.file_name,
        session.uploaded_chunk_indices.len(),
        session.total_chunks,
        session.progress() * 100.0,
    )
}

/// Removes sessions idle longer than `max_age_hours`, or the configured
/// maximum age.
pub fn clean_sessions(config: &AppConfig, max_age_hours: Option<u64>) -> anyhow::Result<usize> {
    let store = open_store(config)?;
    let max_age = match max_age_hours {
        Some(hours) => Duration::from_secs(hours * 3600),
        None => config.engine.session_max_age(),
    };
    let removed = store.clean_expired(max_age)?;
    println!("removed {removed} expired session(s)");
    Ok(removed)
}

/// Deletes one stored session by item id.
pub fn forget_session(config: &AppConfig, id: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if store.remove(id)? {
        println!("forgot {id}");
    } else {
        anyhow::bail!("no session with id {id}");
    }
    Ok(())
}
