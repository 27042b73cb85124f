//! Recall driver: periodic sweep that recalls delegations and layouts past their
//! expiry via the owning client's back channel (spec.md §4.D "Recall driver").

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Kind, Result};
use crate::state::client::ClientId;
use crate::state::stateid::StateId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecallKind {
    Delegation,
    Layout,
}

pub struct Recallable {
    pub client_id: ClientId,
    pub stateid: StateId,
    pub kind: RecallKind,
    pub expiry: Instant,
}

/// Back-channel callback surface the recall driver needs. Real RPC transport is
/// out of scope; a caller supplies an implementation bound to a client's session.
#[async_trait]
pub trait BackChannel: Send + Sync {
    async fn cb_recall(&self, client_id: ClientId, stateid: StateId) -> Result<()>;
    async fn cb_layoutrecall(&self, client_id: ClientId, stateid: StateId) -> Result<()>;
    /// `true` if this client's back channel is currently reachable at all (used to
    /// decide "unreachable back-channel causes direct revocation" without spending
    /// an RPC round trip first).
    fn is_reachable(&self, client_id: ClientId) -> bool;
}

/// Outcome of attempting one recall, driving what the caller does to server state.
pub enum RecallOutcome {
    Recalled,
    /// Back channel unreachable, or the client raced us and already forgot the
    /// state (`NOMATCHING_LAYOUT`): revoke directly without waiting for a reply.
    Revoke,
}

/// Rate-limited recall sweep (spec.md: "issues recall ... rate-limited (e.g., ≤100
/// at a time)").
pub struct RecallDriver {
    back_channel: Arc<dyn BackChannel>,
    queue: Mutex<Vec<Recallable>>,
    max_in_flight: usize,
}

impl RecallDriver {
    pub fn new(back_channel: Arc<dyn BackChannel>, max_in_flight: usize) -> Self {
        Self { back_channel, queue: Mutex::new(Vec::new()), max_in_flight }
    }

    /// Queues a recall, due immediately (OPEN/LAYOUTGET conflict recall, spec.md
    /// §4.D "Conflict recall") or at a future `expiry` (the periodic staleness
    /// sweep, spec.md "Recall driver").
    pub fn enqueue(&self, recallable: Recallable) {
        self.queue.lock().expect("recall queue lock poisoned").push(recallable);
    }

    /// Drains everything past its expiry (up to `max_in_flight`), issuing recalls
    /// or direct revocations per entry, and returns the entries that were revoked
    /// for the caller to clean up.
    pub async fn sweep(&self) -> Vec<(ClientId, StateId, RecallKind)> {
        let due: Vec<Recallable> = {
            let mut queue = self.queue.lock().expect("recall queue lock poisoned");
            let now = Instant::now();
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for entry in queue.drain(..) {
                if entry.expiry <= now && due.len() < self.max_in_flight {
                    due.push(entry);
                } else {
                    remaining.push(entry);
                }
            }
            *queue = remaining;
            due
        };

        let mut revoked = Vec::new();
        for entry in due {
            match self.recall_one(&entry).await {
                RecallOutcome::Recalled => {}
                RecallOutcome::Revoke => revoked.push((entry.client_id, entry.stateid, entry.kind)),
            }
        }
        revoked
    }

    async fn recall_one(&self, entry: &Recallable) -> RecallOutcome {
        if !self.back_channel.is_reachable(entry.client_id) {
            return RecallOutcome::Revoke;
        }
        let result = match entry.kind {
            RecallKind::Delegation => self.back_channel.cb_recall(entry.client_id, entry.stateid).await,
            RecallKind::Layout => self.back_channel.cb_layoutrecall(entry.client_id, entry.stateid).await,
        };
        match result {
            Ok(()) => RecallOutcome::Recalled,
            Err(Error { kind: Kind::NoMatchingLayout }) => RecallOutcome::Revoke,
            Err(_) => RecallOutcome::Revoke,
        }
    }
}

/// Runs [`RecallDriver::sweep`] on a fixed interval until the sender half of
/// `shutdown` is dropped.
pub async fn run_periodic(driver: Arc<RecallDriver>, period: Duration, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => { driver.sweep().await; }
            _ = &mut shutdown => break,
        }
    }
}
