//! Request handles, the cancellation registry, and the per-turn loading guard.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::ChatEvent;
use super::reducer::TurnPhase;

fn phase_from_u8(v: u8) -> TurnPhase {
    match v {
        1 => TurnPhase::Processing,
        2 => TurnPhase::Done,
        _ => TurnPhase::NotRunning,
    }
}

fn phase_to_u8(phase: TurnPhase) -> u8 {
    match phase {
        TurnPhase::NotRunning => 0,
        TurnPhase::Processing => 1,
        TurnPhase::Done => 2,
    }
}

/// One outstanding generate call. Clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: String,
    token: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl Default for RequestHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandle {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token: CancellationToken::new(),
            phase: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signal abort. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// `Processing` once the first event arrived, `Done` when the body closed (or the
    /// turn stopped), back to `NotRunning` after the result was committed and saved.
    pub fn phase(&self) -> TurnPhase {
        phase_from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: TurnPhase) {
        self.phase.store(phase_to_u8(phase), Ordering::Release);
    }
}

/// Shared registry of in-flight requests. Cloned out of the controller so another task
/// (e.g. a Ctrl-C watcher) can stop generation while a turn is streaming.
#[derive(Debug, Clone, Default)]
pub struct Canceller {
    handles: Arc<Mutex<Vec<RequestHandle>>>,
}

impl Canceller {
    /// Cancel every in-flight request; returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        match self.handles.lock() {
            Ok(handles) => {
                for h in handles.iter() {
                    h.cancel();
                }
                handles.len()
            }
            Err(_) => 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub(crate) fn register(&self, handle: RequestHandle) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(0, handle);
        }
    }

    pub(crate) fn release(&self, id: &str) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| h.id() != id);
        }
    }
}

/// Clears the loading state of one turn when dropped, on every exit path.
pub(crate) struct TurnGuard {
    handle: RequestHandle,
    registry: Canceller,
    events: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl TurnGuard {
    pub(crate) fn new(
        handle: RequestHandle,
        registry: Canceller,
        events: Option<mpsc::UnboundedSender<ChatEvent>>,
    ) -> Self {
        registry.register(handle.clone());
        Self {
            handle,
            registry,
            events,
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.handle.set_phase(TurnPhase::Done);
        self.registry.release(self.handle.id());
        if let Some(tx) = &self.events {
            let _ = tx.send(ChatEvent::LoadingFinished {
                turn_id: self.handle.id().to_string(),
            });
        }
    }
}
