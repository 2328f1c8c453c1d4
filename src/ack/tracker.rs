//! Transaction id allocation and acknowledgement tracking
//!
//! Every request the device originates carries a random, currently unused
//! tid. The cloud answers with an ack frame echoing that tid, which wakes
//! the sender blocked in [`RequestTracker::wait_for_ack`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::core::{lock, TID_BLOCK_TIME};

/// Request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Tid minted (and registered), frame not yet waited on.
    New,
    /// Sender is waiting for the ack.
    Sent,
    /// Ack received.
    Acked,
}

/// One outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Transaction id.
    pub tid: u16,
    /// Creation or last state-change time.
    pub created_at: Instant,
    /// Current state.
    pub state: RequestState,
    /// Wake signal for the waiting sender.
    signal: Arc<Notify>,
}

impl PendingRequest {
    fn new(tid: u16) -> Self {
        Self {
            tid,
            created_at: Instant::now(),
            state: RequestState::New,
            signal: Arc::new(Notify::new()),
        }
    }

    /// Age of this entry.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Error returned when a tid cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// Tid was never minted or has been swept.
    #[error("tid {0} is unknown")]
    Unknown(u16),
    /// Tid belongs to a request already in flight.
    #[error("tid {0} already in use")]
    InUse(u16),
}

/// Pending-request table.
///
/// Guarded by its own lock, never held across an `.await`, so a sender
/// blocked on an ack does not stall the socket or other senders.
#[derive(Debug)]
pub struct RequestTracker {
    pending: Mutex<HashMap<u16, PendingRequest>>,
    block_time: Duration,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    /// Create a tracker with the default block time.
    pub fn new() -> Self {
        Self::with_block_time(TID_BLOCK_TIME)
    }

    /// Create a tracker that sweeps entries older than `block_time`.
    pub fn with_block_time(block_time: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            block_time,
        }
    }

    /// Mint a random tid in 1..=65535 that is not pending, and reserve it.
    pub fn new_tid(&self) -> u16 {
        let mut pending = lock(&self.pending);
        if pending.len() >= usize::from(u16::MAX) {
            Self::sweep_locked(&mut pending, self.block_time);
        }
        let mut rng = rand::thread_rng();
        loop {
            let tid = rng.gen_range(1..=u16::MAX);
            if let std::collections::hash_map::Entry::Vacant(slot) = pending.entry(tid) {
                slot.insert(PendingRequest::new(tid));
                return tid;
            }
        }
    }

    /// Register a freshly minted tid just before its frame is written.
    ///
    /// Stale entries are swept first. The entry is stamped and given a fresh
    /// wake signal, so an ack arriving before [`wait_for_ack`](Self::wait_for_ack)
    /// is not lost.
    pub fn register(&self, tid: u16) -> Result<(), RegisterError> {
        let mut pending = lock(&self.pending);
        Self::sweep_locked(&mut pending, self.block_time);

        match pending.get_mut(&tid) {
            Some(entry) if entry.state == RequestState::New => {
                *entry = PendingRequest::new(tid);
                Ok(())
            }
            Some(_) => {
                warn!("tid {} already in use", tid);
                Err(RegisterError::InUse(tid))
            }
            None => Err(RegisterError::Unknown(tid)),
        }
    }

    /// Record an ack for `tid` and wake its sender.
    ///
    /// Late or duplicate acks are logged and ignored. Returns whether a
    /// pending request matched.
    pub fn on_ack(&self, tid: u16) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get_mut(&tid) {
            Some(entry) => {
                entry.state = RequestState::Acked;
                entry.created_at = Instant::now();
                entry.signal.notify_one();
                true
            }
            None => {
                warn!("TID {}: request not found, ack ignored", tid);
                false
            }
        }
    }

    /// Wait up to `wait` for the ack of `tid`.
    ///
    /// The entry is removed afterwards in every case. Returns `true` only if
    /// the request was acknowledged.
    pub async fn wait_for_ack(&self, tid: u16, wait: Duration) -> bool {
        let signal = {
            let mut pending = lock(&self.pending);
            let Some(entry) = pending.get_mut(&tid) else {
                warn!("TID {}: request not registered", tid);
                return false;
            };
            if entry.state == RequestState::Acked {
                pending.remove(&tid);
                return true;
            }
            entry.state = RequestState::Sent;
            entry.created_at = Instant::now();
            Arc::clone(&entry.signal)
        };

        if timeout(wait, signal.notified()).await.is_err() {
            debug!("TID {}: no ack within {:?}", tid, wait);
        }

        let mut pending = lock(&self.pending);
        match pending.remove(&tid) {
            Some(entry) => entry.state == RequestState::Acked,
            None => {
                warn!("TID {}: request vanished while waiting", tid);
                false
            }
        }
    }

    /// Drop `tid` without waiting (e.g. the frame could not be written).
    pub fn remove(&self, tid: u16) -> Option<PendingRequest> {
        lock(&self.pending).remove(&tid)
    }

    /// Remove entries older than `max_age`, whatever their state.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        Self::sweep_locked(&mut lock(&self.pending), max_age)
    }

    fn sweep_locked(pending: &mut HashMap<u16, PendingRequest>, max_age: Duration) -> usize {
        let before = pending.len();
        pending.retain(|tid, entry| {
            let keep = entry.age() <= max_age;
            if !keep {
                debug!("cleaning up request {}", tid);
            }
            keep
        });
        before - pending.len()
    }

    /// Wake every waiting sender; their requests report unacknowledged.
    pub fn wake_all(&self) {
        for entry in lock(&self.pending).values() {
            entry.signal.notify_one();
        }
    }

    /// Forget every pending request.
    pub fn clear(&self) {
        let mut pending = lock(&self.pending);
        for entry in pending.values() {
            entry.signal.notify_one();
        }
        pending.clear();
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Check if no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State of `tid`, if pending.
    pub fn state(&self, tid: u16) -> Option<RequestState> {
        lock(&self.pending).get(&tid).map(|entry| entry.state)
    }
}
