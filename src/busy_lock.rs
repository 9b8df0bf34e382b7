use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const BUSY_PERMITS: u32 = 1 << 20;

/// Close guard: operations enter in shared mode, `block` waits for every
/// in-flight operation to leave and then refuses new ones for good.
#[derive(Debug)]
pub struct BusyLock {
    /// Fast-path check so callers fail before touching the semaphore.
    blocked: AtomicBool,
    gate: Arc<Semaphore>,
}

impl Default for BusyLock {
    fn default() -> Self {
        Self {
            blocked: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(BUSY_PERMITS as usize)),
        }
    }
}

/// Held while an operation runs; dropping it lets `block` make progress.
#[derive(Debug)]
pub struct BusyGuard {
    _permit: OwnedSemaphorePermit,
}

impl BusyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` once `block` has started.
    pub fn enter(&self) -> Option<BusyGuard> {
        if self.blocked.load(Ordering::Acquire) {
            return None;
        }
        let permit = Arc::clone(&self.gate).try_acquire_owned().ok()?;
        Some(BusyGuard { _permit: permit })
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Waits for in-flight guards to drop. Idempotent.
    pub async fn block(&self) {
        self.blocked.store(true, Ordering::Release);
        if let Ok(all) = self.gate.acquire_many(BUSY_PERMITS).await {
            all.forget();
        }
        self.gate.close();
    }
}
