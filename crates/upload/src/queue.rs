//! Upload queue: runs many items with a bounded number active at once.
//!
//! Every enqueued item gets its own actor task that owns the
//! [`UploadItem`]. Callers steer it through an [`UploadHandle`]; the actor
//! re-drives the item when a pause is lifted, a retry is requested, or the
//! item is cancelled.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::machine::ItemEvent;
use crate::orchestrator::UploadOrchestrator;
use crate::types::{Control, UploadItem, UploadState};

/// Latest known state of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemSnapshot {
    pub state: UploadState,
    /// The actor is idle, waiting for a command or already finished.
    pub settled: bool,
}

/// Runs items through a shared [`UploadOrchestrator`].
pub struct UploadQueue {
    orchestrator: Arc<UploadOrchestrator>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl UploadQueue {
    /// At most `config.max_concurrent_items` items are driven at once.
    pub fn new(orchestrator: Arc<UploadOrchestrator>) -> Self {
        let permits = Arc::new(Semaphore::new(orchestrator.config().max_concurrent_items));
        Self {
            orchestrator,
            permits,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<UploadOrchestrator> {
        &self.orchestrator
    }

    /// Spawns the actor for `item` and returns its handle.
    pub fn enqueue(&self, item: UploadItem) -> UploadHandle {
        let id = item.id.clone();
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let snapshot = Arc::new(watch::Sender::new(ItemSnapshot {
            state: item.state,
            settled: false,
        }));

        let actor = ItemActor {
            orchestrator: Arc::clone(&self.orchestrator),
            permits: Arc::clone(&self.permits),
            shutdown: self.shutdown.clone(),
            control: control_rx,
            snapshot: Arc::clone(&snapshot),
        };
        let task = tokio::spawn(actor.run(item));

        UploadHandle {
            id,
            control: control_tx,
            snapshot,
            task,
        }
    }

    /// Stops idle actors and those still waiting for a slot.
    ///
    /// Items being driven finish their current run first; their sessions
    /// stay in the store and can be resumed later.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Caller side of a queued item.
pub struct UploadHandle {
    id: String,
    control: watch::Sender<Control>,
    snapshot: Arc<watch::Sender<ItemSnapshot>>,
    task: JoinHandle<UploadItem>,
}

impl UploadHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> UploadState {
        self.snapshot.borrow().state
    }

    pub fn pause(&self) {
        self.command(Control::Pause);
    }

    pub fn resume(&self) {
        self.command(Control::Run);
    }

    /// Retries a failed item with a fresh retry budget.
    pub fn retry(&self) {
        self.command(Control::Run);
    }

    pub fn cancel(&self) {
        self.command(Control::Cancel);
    }

    fn command(&self, signal: Control) {
        // Unsettle before signalling so `settled` waits for the reaction.
        self.snapshot.send_if_modified(|s| {
            let changed = s.settled && !s.state.is_terminal();
            if changed {
                s.settled = false;
            }
            changed
        });
        self.control.send_replace(signal);
    }

    /// Waits until the actor is idle and returns the item state.
    pub async fn settled(&self) -> UploadState {
        let mut rx = self.snapshot.subscribe();
        if let Ok(snapshot) = rx.wait_for(|s| s.settled).await {
            return snapshot.state;
        }
        self.state()
    }

    /// Waits for the actor to finish and returns the final item.
    pub async fn join(self) -> Result<UploadItem, JoinError> {
        self.task.await
    }
}

struct ItemActor {
    orchestrator: Arc<UploadOrchestrator>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    control: watch::Receiver<Control>,
    snapshot: Arc<watch::Sender<ItemSnapshot>>,
}

impl ItemActor {
    async fn run(mut self, mut item: UploadItem) -> UploadItem {
        let mut event = ItemEvent::Start;

        loop {
            let permit = if *self.control.borrow() == Control::Cancel {
                None
            } else {
                let mut watcher = self.control.clone();
                tokio::select! {
                    permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
                    _ = self.shutdown.cancelled() => {
                        self.settle(item.state);
                        return item;
                    }
                    _ = wait_for_cancel(&mut watcher) => None,
                }
            };
            if *self.control.borrow() == Control::Cancel {
                event = ItemEvent::Cancel;
            }

            debug!(item = %item.id, ?event, "driving upload");
            item = self
                .orchestrator
                .drive_observed(item, event, &self.control, Some(self.snapshot.as_ref()))
                .await;
            drop(permit);

            self.settle(item.state);
            if item.state.is_terminal() {
                return item;
            }

            match self.next_command(item.state).await {
                Some(next) => event = next,
                None => return item,
            }
        }
    }

    fn settle(&self, state: UploadState) {
        self.snapshot.send_replace(ItemSnapshot {
            state,
            settled: true,
        });
    }

    /// Waits for a control change that applies to an item at rest in
    /// `state`. `None` on shutdown or when the handle is gone.
    async fn next_command(&mut self, state: UploadState) -> Option<ItemEvent> {
        let mut fresh = false;
        loop {
            let signal = *self.control.borrow_and_update();
            match (signal, state) {
                (Control::Cancel, _) => return Some(ItemEvent::Cancel),
                (Control::Run, UploadState::Paused) => return Some(ItemEvent::Resume),
                (Control::Run, UploadState::Failed) if fresh => {
                    return Some(ItemEvent::ManualRetry);
                }
                _ if fresh => self.settle(state),
                _ => {}
            }

            tokio::select! {
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.shutdown.cancelled() => return None,
            }
            fresh = true;
        }
    }
}

async fn wait_for_cancel(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
