use crate::error::PartTxError;
use crate::tx::ids::TransactionId;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` already satisfies a request for `requested`.
    pub fn covers(self, requested: LockMode) -> bool {
        self == LockMode::Exclusive || requested == LockMode::Shared
    }
}

/// A lockable resource: an object (table, index) plus a key inside it.
/// An empty key locks the whole object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub context_id: i32,
    pub key: Vec<u8>,
}

impl LockKey {
    pub fn new(context_id: i32, key: impl Into<Vec<u8>>) -> Self {
        Self {
            context_id,
            key: key.into(),
        }
    }

    pub fn object(context_id: i32) -> Self {
        Self {
            context_id,
            key: Vec::new(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.context_id)?;
        for b in &self.key {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: LockKey,
    pub tx_id: TransactionId,
    pub mode: LockMode,
}

struct Waiter {
    id: u64,
    tx_id: TransactionId,
    mode: LockMode,
    granted_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    holders: SmallVec<[(TransactionId, LockMode); 2]>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn held_by(&self, tx_id: TransactionId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(holder, _)| *holder == tx_id)
            .map(|(_, mode)| *mode)
    }

    /// Holders other than `tx_id` whose mode conflicts with `mode`.
    fn conflicting(
        &self,
        tx_id: TransactionId,
        mode: LockMode,
    ) -> impl Iterator<Item = TransactionId> + '_ {
        self.holders
            .iter()
            .filter(move |(holder, held)| *holder != tx_id && !held.is_compatible(mode))
            .map(|(holder, _)| *holder)
    }

    fn grant(&mut self, tx_id: TransactionId, mode: LockMode) {
        if let Some(slot) = self.holders.iter_mut().find(|(holder, _)| *holder == tx_id) {
            if mode == LockMode::Exclusive {
                slot.1 = LockMode::Exclusive;
            }
        } else {
            self.holders.push((tx_id, mode));
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

enum AcquireStep {
    Granted,
    Wait(u64, oneshot::Receiver<()>),
}

/// Row/key lock table with shared and exclusive modes.
///
/// Deadlocks are avoided by wait-die ordering on transaction ids: a request
/// queues only behind younger holders, a younger requester fails with
/// [`PartTxError::LockConflict`] and is expected to abort.
pub struct LockManager {
    table: DashMap<LockKey, LockState>,
    owned: DashMap<TransactionId, HashSet<LockKey>>,
    wait_timeout: Duration,
    next_waiter_id: AtomicU64,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            table: DashMap::new(),
            owned: DashMap::new(),
            wait_timeout,
            next_waiter_id: AtomicU64::new(1),
        }
    }

    pub async fn acquire(
        &self,
        tx_id: TransactionId,
        key: LockKey,
        mode: LockMode,
    ) -> Result<Lock, PartTxError> {
        let (waiter_id, mut granted_rx) = match self.try_acquire_or_enqueue(tx_id, &key, mode)? {
            AcquireStep::Granted => return Ok(Lock { key, tx_id, mode }),
            AcquireStep::Wait(waiter_id, rx) => (waiter_id, rx),
        };

        debug!(%tx_id, key = %key, ?mode, "lock request queued");
        let waited = tokio::time::timeout(self.wait_timeout, &mut granted_rx).await;
        if matches!(waited, Ok(Ok(()))) {
            return Ok(Lock { key, tx_id, mode });
        }

        // Timed out. A grant may have raced with the timer, so settle under the entry lock.
        if let Some(mut state) = self.table.get_mut(&key) {
            if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                state.waiters.remove(pos);
                self.grant_waiters(&key, &mut state);
                drop(state);
                self.table.remove_if(&key, |_, s| s.is_idle());
                warn!(%tx_id, key = %key, ?mode, "lock wait timed out");
                return Err(PartTxError::LockTimeout {
                    tx_id,
                    key: key.to_string(),
                });
            }
            if state.held_by(tx_id).is_some_and(|held| held.covers(mode)) {
                return Ok(Lock { key, tx_id, mode });
            }
        }
        Err(PartTxError::LockTimeout {
            tx_id,
            key: key.to_string(),
        })
    }

    fn try_acquire_or_enqueue(
        &self,
        tx_id: TransactionId,
        key: &LockKey,
        mode: LockMode,
    ) -> Result<AcquireStep, PartTxError> {
        let mut state = self.table.entry(key.clone()).or_default();

        if state.held_by(tx_id).is_some_and(|held| held.covers(mode)) {
            return Ok(AcquireStep::Granted);
        }

        let conflicting: SmallVec<[TransactionId; 2]> = state.conflicting(tx_id, mode).collect();
        let upgrading = state.held_by(tx_id).is_some();
        if conflicting.is_empty() && (upgrading || state.waiters.is_empty()) {
            state.grant(tx_id, mode);
            // Recorded under the entry lock so a concurrent release_all sees the key.
            self.record_owned(tx_id, key);
            return Ok(AcquireStep::Granted);
        }

        let older_than_all = conflicting.iter().all(|holder| tx_id < *holder)
            && state
                .waiters
                .iter()
                .filter(|w| w.tx_id != tx_id && !w.mode.is_compatible(mode))
                .all(|w| tx_id < w.tx_id);
        if !older_than_all {
            drop(state);
            self.table.remove_if(key, |_, s| s.is_idle());
            return Err(PartTxError::LockConflict {
                tx_id,
                key: key.to_string(),
            });
        }

        let (granted_tx, granted_rx) = oneshot::channel();
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        state.waiters.push_back(Waiter {
            id: waiter_id,
            tx_id,
            mode,
            granted_tx,
        });
        Ok(AcquireStep::Wait(waiter_id, granted_rx))
    }

    fn record_owned(&self, tx_id: TransactionId, key: &LockKey) {
        self.owned.entry(tx_id).or_default().insert(key.clone());
    }

    /// Grants queued requests in FIFO order until the first one that still conflicts.
    /// Runs under the key's entry lock, so ownership is recorded before the waiter wakes.
    fn grant_waiters(&self, key: &LockKey, state: &mut LockState) {
        while let Some(front) = state.waiters.front() {
            if state.conflicting(front.tx_id, front.mode).next().is_some() {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let newly_held = state.held_by(waiter.tx_id).is_none();
            state.grant(waiter.tx_id, waiter.mode);
            if newly_held {
                self.record_owned(waiter.tx_id, key);
            }
            if waiter.granted_tx.send(()).is_err() {
                // Requester went away; undo a fresh grant.
                if newly_held {
                    state.holders.retain(|(holder, _)| *holder != waiter.tx_id);
                    self.forget_owned(waiter.tx_id, key);
                }
                continue;
            }
            debug!(tx_id = %waiter.tx_id, key = %key, mode = ?waiter.mode, "queued lock granted");
        }
    }

    fn forget_owned(&self, tx_id: TransactionId, key: &LockKey) {
        if let Some(mut keys) = self.owned.get_mut(&tx_id) {
            keys.remove(key);
        }
        self.owned.remove_if(&tx_id, |_, keys| keys.is_empty());
    }

    fn release_key(&self, tx_id: TransactionId, key: &LockKey) {
        if let Some(mut state) = self.table.get_mut(key) {
            state.holders.retain(|(holder, _)| *holder != tx_id);
            self.grant_waiters(key, &mut state);
        }
        self.table.remove_if(key, |_, s| s.is_idle());
    }

    pub fn release(&self, lock: &Lock) {
        self.forget_owned(lock.tx_id, &lock.key);
        self.release_key(lock.tx_id, &lock.key);
    }

    /// Releases every lock of the transaction. Called once when it finishes.
    pub fn release_all(&self, tx_id: TransactionId) {
        let Some((_, keys)) = self.owned.remove(&tx_id) else {
            return;
        };
        debug!(%tx_id, locks = keys.len(), "releasing transaction locks");
        for key in &keys {
            self.release_key(tx_id, key);
        }
    }

    pub fn locks(&self, tx_id: TransactionId) -> Vec<Lock> {
        let Some(keys) = self.owned.get(&tx_id).map(|k| k.value().clone()) else {
            return Vec::new();
        };
        keys.into_iter()
            .filter_map(|key| {
                let mode = self.table.get(&key)?.held_by(tx_id)?;
                Some(Lock { key, tx_id, mode })
            })
            .collect()
    }

    /// Number of keys with at least one holder or waiter.
    pub fn locked_keys(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
