//! Correlates push confirmations with the bulk writes waiting for them.
//!
//! A confirmation can arrive before the write's HTTP response has been
//! processed. Such early arrivals are buffered for one window and handed
//! over when the write registers its correlation id.

use crate::events::SyncEvent;
use plantwatch_core::{CommandStatusEvent, CorrelationId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What happened to a delivered confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a waiting write.
    Matched,
    /// Nobody is waiting yet; kept for one buffer window.
    Buffered,
}

#[derive(Debug, Default)]
struct HubInner {
    waiting: HashMap<CorrelationId, oneshot::Sender<CommandStatusEvent>>,
    early: HashMap<CorrelationId, (Instant, CommandStatusEvent)>,
}

#[derive(Debug)]
pub struct ConfirmationHub {
    inner: Mutex<HubInner>,
    buffer_window: Duration,
}

impl ConfirmationHub {
    pub fn new(buffer_window: Duration) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            buffer_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_expired(&self, inner: &mut HubInner) {
        let now = Instant::now();
        let window = self.buffer_window;
        inner
            .early
            .retain(|_, (received_at, _)| now.duration_since(*received_at) < window);
    }

    /// Wait for the confirmation of `id`.
    ///
    /// Resolves immediately if a matching confirmation was buffered.
    pub fn register(&self, id: CorrelationId) -> oneshot::Receiver<CommandStatusEvent> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        self.purge_expired(&mut inner);
        if let Some((_, event)) = inner.early.remove(&id) {
            tracing::debug!(correlation_id = %id, "Matched buffered confirmation");
            let _ = tx.send(event);
        } else {
            inner.waiting.insert(id, tx);
        }
        rx
    }

    pub fn deliver(&self, event: CommandStatusEvent) -> Delivery {
        let mut inner = self.lock();
        self.purge_expired(&mut inner);
        let id = event.message_id.clone();
        if let Some(tx) = inner.waiting.remove(&id) {
            tracing::debug!(correlation_id = %id, "Confirmation matched");
            let _ = tx.send(event);
            return Delivery::Matched;
        }
        tracing::debug!(correlation_id = %id, "Buffering early confirmation");
        inner.early.insert(id, (Instant::now(), event));
        Delivery::Buffered
    }

    /// Stop waiting for `id`.
    pub fn forget(&self, id: &CorrelationId) {
        let mut inner = self.lock();
        inner.waiting.remove(id);
        inner.early.remove(id);
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn buffered_count(&self) -> usize {
        let mut inner = self.lock();
        self.purge_expired(&mut inner);
        inner.early.len()
    }
}

/// Route confirmation events from the realtime manager into `hub`.
pub fn spawn_confirmation_router(
    hub: Arc<ConfirmationHub>,
    mut events: mpsc::Receiver<SyncEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::Confirmation(confirmation) => {
                    hub.deliver(confirmation);
                }
                SyncEvent::Connected { tenant_id } => {
                    tracing::debug!(tenant_id = %tenant_id, "Confirmation channel ready");
                }
                SyncEvent::Disconnected { reason } => {
                    tracing::debug!(reason = %reason, "Confirmation channel down");
                }
                SyncEvent::Error(message) => {
                    tracing::warn!(error = %message, "Confirmation channel error");
                }
            }
        }
    })
}
