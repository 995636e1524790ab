//! Per-item upload state machine.
//!
//! [`transition`] is pure: it returns the next item and the effects the
//! driver must run. Effects produce new [`ItemEvent`]s which are fed back
//! until the item settles.
//!
//! ```text
//! Pending -> Analyzing -> CheckingInstant -> Completed
//!                                         -> Preparing -> Uploading -> Completed
//!                                                                   -> Paused -> Uploading
//!                                                                   -> Failed -> Retrying -> Uploading
//! (any non-terminal) -> Cancelled
//! ```

use std::time::Duration;

use pixdrop_protocol::RemoteFile;

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::types::{UploadItem, UploadState};

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Start,
    Analyzed {
        digest: String,
    },
    /// The file could not be read. Never retried automatically.
    AnalysisFailed {
        error: String,
    },
    ProbeHit(RemoteFile),
    ProbeMiss,
    /// A server session was created or resumed. `uploaded` is the
    /// reconciled confirmed set.
    SessionReady {
        session_id: String,
        uploaded: Vec<u32>,
        created_at: i64,
    },
    PrepareFailed {
        error: String,
    },
    /// Server status was re-read before (re)entering `Uploading`.
    StatusSynced {
        uploaded: Vec<u32>,
    },
    /// The server no longer knows the session.
    SessionLost,
    /// Every chunk is confirmed locally.
    ChunksUploaded,
    /// Final verification found chunks missing on the server.
    Incomplete {
        uploaded: Vec<u32>,
    },
    Completed(RemoteFile),
    UploadFailed {
        error: String,
    },
    Pause,
    Resume,
    Cancel,
    /// An automatic retry delay elapsed.
    RetryDue,
    /// User-requested retry; resets the retry budget.
    ManualRetry,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hash the file.
    Analyze,
    /// Run the instant-upload probe.
    Probe,
    /// Resume a stored session or create a new one.
    Prepare,
    /// Re-read server status for the current session.
    SyncStatus,
    /// Write the item's session to the store.
    Persist,
    /// Run the chunk scheduler.
    Upload,
    /// Verify server status and complete the upload.
    Finalize,
    /// Best-effort server-side discard.
    NotifyCancel { session_id: String },
    /// Delete the item's session from the store.
    RemoveSession,
    /// Wait, then deliver [`ItemEvent::RetryDue`].
    ScheduleRetry(Duration),
}

/// Applies `event` to `item`.
///
/// Events that make no sense in the current state leave the item unchanged
/// and request nothing.
pub fn transition(
    mut item: UploadItem,
    event: ItemEvent,
    config: &EngineConfig,
) -> (UploadItem, Vec<Effect>) {
    use ItemEvent as E;
    use UploadState as S;

    let effects = match (item.state, event) {
        (_, E::Cancel) if !item.state.is_terminal() => {
            let mut effects = Vec::new();
            if let Some(session_id) = item.session_id.take() {
                effects.push(Effect::NotifyCancel { session_id });
            }
            effects.push(Effect::RemoveSession);
            item.state = S::Cancelled;
            item.uploaded_chunk_indices.clear();
            item.failed_chunk_indices.clear();
            item.speed_bytes_per_sec = 0.0;
            item.eta_seconds = None;
            effects
        }

        (S::Pending, E::Start) => {
            if item.file_digest.is_some() {
                item.state = S::CheckingInstant;
                vec![Effect::Probe]
            } else {
                item.state = S::Analyzing;
                vec![Effect::Analyze]
            }
        }

        (S::Analyzing, E::Analyzed { digest }) => {
            item.file_digest.get_or_insert(digest);
            item.state = S::CheckingInstant;
            vec![Effect::Probe]
        }

        (S::Analyzing | S::Preparing | S::Uploading | S::Retrying, E::AnalysisFailed { error }) => {
            item.state = S::Failed;
            item.error = Some(error);
            item.session_id = None;
            vec![Effect::RemoveSession]
        }

        (S::CheckingInstant, E::ProbeHit(file)) => {
            item.state = S::Completed;
            item.remote = Some(file);
            item.eta_seconds = Some(0.0);
            Vec::new()
        }

        (S::CheckingInstant, E::ProbeMiss) => {
            item.state = S::Preparing;
            vec![Effect::Prepare]
        }

        (
            S::Preparing | S::Retrying,
            E::SessionReady {
                session_id,
                uploaded,
                created_at,
            },
        ) => {
            item.session_id = Some(session_id);
            item.session_created_at = Some(created_at);
            item.set_uploaded(uploaded);
            item.state = S::Uploading;
            vec![Effect::Persist, Effect::Upload]
        }

        (S::Preparing | S::Retrying | S::Uploading, E::PrepareFailed { error })
        | (S::Preparing | S::Retrying | S::Uploading, E::UploadFailed { error }) => {
            fail(&mut item, error, config)
        }

        (S::Uploading | S::Retrying, E::StatusSynced { uploaded }) => {
            item.set_uploaded(uploaded);
            item.state = S::Uploading;
            vec![Effect::Persist, Effect::Upload]
        }

        (S::Uploading | S::Retrying, E::SessionLost) => {
            item.session_id = None;
            item.session_created_at = None;
            item.uploaded_chunk_indices.clear();
            item.failed_chunk_indices.clear();
            item.state = S::Preparing;
            vec![Effect::RemoveSession, Effect::Prepare]
        }

        (S::Uploading, E::ChunksUploaded) => vec![Effect::Finalize],

        (S::Uploading, E::Incomplete { uploaded }) => {
            item.set_uploaded(uploaded);
            if item.retry_count < item.max_retries {
                item.retry_count += 1;
                vec![Effect::Persist, Effect::Upload]
            } else {
                let error = UploadError::IncompleteAtCompletion {
                    confirmed: item.uploaded_chunk_indices.len() as u32,
                    total: item.total_chunks,
                };
                fail(&mut item, error.to_string(), config)
            }
        }

        (S::Uploading, E::Completed(file)) => {
            item.state = S::Completed;
            item.remote = Some(file);
            item.error = None;
            item.eta_seconds = Some(0.0);
            vec![Effect::RemoveSession]
        }

        (S::Uploading | S::Retrying, E::Pause) => {
            item.state = S::Paused;
            item.eta_seconds = None;
            Vec::new()
        }

        (S::Paused, E::Resume) => {
            item.state = S::Uploading;
            restart(&mut item)
        }

        (S::Failed, E::RetryDue) => {
            item.state = S::Retrying;
            restart(&mut item)
        }

        (S::Failed, E::ManualRetry) => {
            item.retry_count = 0;
            item.error = None;
            item.failed_chunk_indices.clear();
            item.state = S::Retrying;
            restart(&mut item)
        }

        _ => Vec::new(),
    };

    (item, effects)
}

/// Marks the item failed and schedules an automatic retry while the budget
/// lasts.
fn fail(item: &mut UploadItem, error: String, config: &EngineConfig) -> Vec<Effect> {
    item.state = UploadState::Failed;
    item.error = Some(error);
    item.speed_bytes_per_sec = 0.0;
    item.eta_seconds = None;

    if item.retry_count < item.max_retries {
        item.retry_count += 1;
        vec![Effect::ScheduleRetry(
            config.auto_retry_delay(item.retry_count),
        )]
    } else {
        vec![Effect::RemoveSession]
    }
}

/// Picks the step that brings a stopped item back to uploading: re-sync an
/// existing session, otherwise prepare one, otherwise re-hash.
fn restart(item: &mut UploadItem) -> Vec<Effect> {
    if item.session_id.is_some() {
        vec![Effect::SyncStatus]
    } else if item.file_digest.is_some() {
        item.state = UploadState::Preparing;
        vec![Effect::Prepare]
    } else {
        item.state = UploadState::Analyzing;
        vec![Effect::Analyze]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::remote_file;
    use crate::types::test_item;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn step(item: UploadItem, event: ItemEvent) -> (UploadItem, Vec<Effect>) {
        transition(item, event, &config())
    }

    fn uploading() -> UploadItem {
        let mut item = test_item(20, 4);
        item.file_digest = Some("digest".into());
        item.session_id = Some("srv-1".into());
        item.state = UploadState::Uploading;
        item
    }

    #[test]
    fn happy_path() {
        let item = test_item(20, 4);
        let (item, fx) = step(item, ItemEvent::Start);
        assert_eq!(item.state, UploadState::Analyzing);
        assert_eq!(fx, vec![Effect::Analyze]);

        let (item, fx) = step(
            item,
            ItemEvent::Analyzed {
                digest: "d".into(),
            },
        );
        assert_eq!(item.state, UploadState::CheckingInstant);
        assert_eq!(item.file_digest.as_deref(), Some("d"));
        assert_eq!(fx, vec![Effect::Probe]);

        let (item, fx) = step(item, ItemEvent::ProbeMiss);
        assert_eq!(item.state, UploadState::Preparing);
        assert_eq!(fx, vec![Effect::Prepare]);

        let (item, fx) = step(
            item,
            ItemEvent::SessionReady {
                session_id: "srv-9".into(),
                uploaded: vec![0, 1],
                created_at: 7,
            },
        );
        assert_eq!(item.state, UploadState::Uploading);
        assert_eq!(item.session_id.as_deref(), Some("srv-9"));
        assert_eq!(item.uploaded_chunk_indices.len(), 2);
        assert_eq!(fx, vec![Effect::Persist, Effect::Upload]);

        let (item, fx) = step(item, ItemEvent::ChunksUploaded);
        assert_eq!(item.state, UploadState::Uploading);
        assert_eq!(fx, vec![Effect::Finalize]);

        let (item, fx) = step(item, ItemEvent::Completed(remote_file("r")));
        assert_eq!(item.state, UploadState::Completed);
        assert_eq!(item.remote.unwrap().id, "r");
        assert_eq!(fx, vec![Effect::RemoveSession]);
    }

    #[test]
    fn known_digest_skips_analysis() {
        let mut item = test_item(20, 4);
        item.file_digest = Some("d".into());
        let (item, fx) = step(item, ItemEvent::Start);
        assert_eq!(item.state, UploadState::CheckingInstant);
        assert_eq!(fx, vec![Effect::Probe]);
    }

    #[test]
    fn digest_is_never_replaced() {
        let mut item = test_item(20, 4);
        item.file_digest = Some("first".into());
        item.state = UploadState::Analyzing;
        let (item, _) = step(
            item,
            ItemEvent::Analyzed {
                digest: "second".into(),
            },
        );
        assert_eq!(item.file_digest.as_deref(), Some("first"));
    }

    #[test]
    fn probe_hit_completes_without_effects() {
        let mut item = test_item(20, 4);
        item.state = UploadState::CheckingInstant;
        let (item, fx) = step(item, ItemEvent::ProbeHit(remote_file("dup")));
        assert_eq!(item.state, UploadState::Completed);
        assert!(fx.is_empty());
    }

    #[test]
    fn analysis_failure_is_not_retried() {
        let mut item = test_item(20, 4);
        item.state = UploadState::Analyzing;
        let (item, fx) = step(
            item,
            ItemEvent::AnalysisFailed {
                error: "unreadable".into(),
            },
        );
        assert_eq!(item.state, UploadState::Failed);
        assert_eq!(item.retry_count, 0);
        assert_eq!(fx, vec![Effect::RemoveSession]);
    }

    #[test]
    fn failure_schedules_growing_retries_then_gives_up() {
        let mut item = uploading();
        let mut delays = Vec::new();
        loop {
            let (next, fx) = step(
                item,
                ItemEvent::UploadFailed {
                    error: "boom".into(),
                },
            );
            assert_eq!(next.state, UploadState::Failed);
            match fx.as_slice() {
                [Effect::ScheduleRetry(d)] => delays.push(*d),
                [Effect::RemoveSession] => {
                    item = next;
                    break;
                }
                other => panic!("unexpected effects {other:?}"),
            }
            let (retrying, fx) = step(next, ItemEvent::RetryDue);
            assert_eq!(retrying.state, UploadState::Retrying);
            assert_eq!(fx, vec![Effect::SyncStatus]);
            let (again, _) = step(retrying, ItemEvent::StatusSynced { uploaded: vec![] });
            assert_eq!(again.state, UploadState::Uploading);
            item = again;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6)
            ]
        );
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.error.as_deref(), Some("boom"));
    }

    #[test]
    fn manual_retry_resets_budget() {
        let mut item = uploading();
        item.state = UploadState::Failed;
        item.retry_count = 3;
        item.error = Some("boom".into());
        let (item, fx) = step(item, ItemEvent::ManualRetry);
        assert_eq!(item.state, UploadState::Retrying);
        assert_eq!(item.retry_count, 0);
        assert!(item.error.is_none());
        assert_eq!(fx, vec![Effect::SyncStatus]);
    }

    #[test]
    fn retry_without_session_prepares_or_analyzes() {
        let mut item = test_item(20, 4);
        item.state = UploadState::Failed;
        item.file_digest = Some("d".into());
        let (item, fx) = step(item, ItemEvent::RetryDue);
        assert_eq!(item.state, UploadState::Preparing);
        assert_eq!(fx, vec![Effect::Prepare]);

        let mut item = test_item(20, 4);
        item.state = UploadState::Failed;
        let (item, fx) = step(item, ItemEvent::ManualRetry);
        assert_eq!(item.state, UploadState::Analyzing);
        assert_eq!(fx, vec![Effect::Analyze]);
    }

    #[test]
    fn pause_and_resume_resyncs_status() {
        let (item, fx) = step(uploading(), ItemEvent::Pause);
        assert_eq!(item.state, UploadState::Paused);
        assert!(fx.is_empty());

        let (item, fx) = step(item, ItemEvent::Resume);
        assert_eq!(item.state, UploadState::Uploading);
        assert_eq!(fx, vec![Effect::SyncStatus]);

        let (item, fx) = step(item, ItemEvent::StatusSynced { uploaded: vec![0, 1, 2] });
        assert_eq!(item.uploaded_chunk_indices.len(), 3);
        assert_eq!(fx, vec![Effect::Persist, Effect::Upload]);
    }

    #[test]
    fn cancel_from_any_active_state() {
        for state in [
            UploadState::Pending,
            UploadState::Analyzing,
            UploadState::CheckingInstant,
            UploadState::Preparing,
            UploadState::Paused,
            UploadState::Retrying,
            UploadState::Failed,
        ] {
            let mut item = test_item(20, 4);
            item.state = state;
            let (item, fx) = step(item, ItemEvent::Cancel);
            assert_eq!(item.state, UploadState::Cancelled, "{state}");
            assert_eq!(fx, vec![Effect::RemoveSession], "{state}");
        }

        let mut item = uploading();
        item.mark_uploaded(0);
        let (item, fx) = step(item, ItemEvent::Cancel);
        assert_eq!(item.state, UploadState::Cancelled);
        assert!(item.session_id.is_none());
        assert!(item.uploaded_chunk_indices.is_empty());
        assert_eq!(
            fx,
            vec![
                Effect::NotifyCancel {
                    session_id: "srv-1".into()
                },
                Effect::RemoveSession
            ]
        );
    }

    #[test]
    fn terminal_states_ignore_events() {
        for state in [UploadState::Completed, UploadState::Cancelled] {
            let mut item = uploading();
            item.state = state;
            for event in [
                ItemEvent::Cancel,
                ItemEvent::Start,
                ItemEvent::Resume,
                ItemEvent::ManualRetry,
                ItemEvent::ChunksUploaded,
            ] {
                let (next, fx) = step(item.clone(), event);
                assert_eq!(next.state, state);
                assert!(fx.is_empty());
            }
        }
    }

    #[test]
    fn invalid_pairs_are_ignored() {
        let item = test_item(20, 4);
        let (item, fx) = step(item, ItemEvent::ChunksUploaded);
        assert_eq!(item.state, UploadState::Pending);
        assert!(fx.is_empty());
        let (item, fx) = step(item, ItemEvent::Resume);
        assert_eq!(item.state, UploadState::Pending);
        assert!(fx.is_empty());
    }

    #[test]
    fn incomplete_reenters_upload_within_budget() {
        let mut item = uploading();
        item.set_uploaded(0..5);
        let (item, fx) = step(item, ItemEvent::Incomplete { uploaded: vec![0, 1, 2, 4] });
        assert_eq!(item.state, UploadState::Uploading);
        assert_eq!(item.pending_chunks(), vec![3]);
        assert_eq!(item.retry_count, 1);
        assert_eq!(fx, vec![Effect::Persist, Effect::Upload]);

        let mut exhausted = item;
        exhausted.retry_count = exhausted.max_retries;
        let (item, fx) = step(exhausted, ItemEvent::Incomplete { uploaded: vec![0] });
        assert_eq!(item.state, UploadState::Failed);
        assert!(item.error.unwrap().contains("1 of 5"));
        assert_eq!(fx, vec![Effect::RemoveSession]);
    }

    #[test]
    fn lost_session_is_prepared_again() {
        let mut item = uploading();
        item.mark_uploaded(0);
        let (item, fx) = step(item, ItemEvent::SessionLost);
        assert_eq!(item.state, UploadState::Preparing);
        assert!(item.session_id.is_none());
        assert!(item.uploaded_chunk_indices.is_empty());
        assert_eq!(fx, vec![Effect::RemoveSession, Effect::Prepare]);
    }
}
