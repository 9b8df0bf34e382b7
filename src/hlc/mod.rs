use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits holding the logical counter.
pub const LOGICAL_TIME_BITS_SIZE: u32 = 16;

const LOGICAL_TIME_MASK: u64 = (1 << LOGICAL_TIME_BITS_SIZE) - 1;
const MAX_PHYSICAL_TIME: u64 = u64::MAX >> LOGICAL_TIME_BITS_SIZE;

/// Physical milliseconds in the high 48 bits, logical counter in the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    pub const MIN_VALUE: HybridTimestamp = HybridTimestamp(1 << LOGICAL_TIME_BITS_SIZE);

    pub fn new(physical: u64, logical: u16) -> Self {
        debug_assert!(physical <= MAX_PHYSICAL_TIME, "physical time overflow");
        Self(((physical & MAX_PHYSICAL_TIME) << LOGICAL_TIME_BITS_SIZE) | logical as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn physical(self) -> u64 {
        self.0 >> LOGICAL_TIME_BITS_SIZE
    }

    pub fn logical(self) -> u16 {
        (self.0 & LOGICAL_TIME_MASK) as u16
    }

    /// Smallest timestamp strictly greater than `self`. A full logical counter
    /// carries into the physical part.
    pub fn tick(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn add_physical_time(self, millis: u64) -> Self {
        Self::new(self.physical().saturating_add(millis), self.logical())
    }

    pub fn subtract_physical_time(self, millis: u64) -> Self {
        let physical = self.physical().saturating_sub(millis).max(1);
        Self::new(physical, self.logical())
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HybridTimestamp [physical={}, logical={}]",
            self.physical(),
            self.logical()
        )
    }
}

/// Monotonic hybrid logical clock.
pub trait HybridClock: Send + Sync {
    /// Strictly greater than every value previously returned by this clock.
    fn now(&self) -> HybridTimestamp;

    /// Advances the clock past a timestamp received from another node and
    /// returns a value strictly greater than both.
    fn update(&self, request_time: HybridTimestamp) -> HybridTimestamp;
}

/// Source of physical milliseconds.
pub trait PhysicalTime: Send + Sync {
    fn current_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl PhysicalTime for SystemTimeSource {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Physical time that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl PhysicalTime for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}

pub struct HybridClockImpl {
    latest: AtomicU64,
    physical: Arc<dyn PhysicalTime>,
}

impl fmt::Debug for HybridClockImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClockImpl")
            .field("latest", &HybridTimestamp(self.latest.load(Ordering::Relaxed)))
            .finish()
    }
}

impl Default for HybridClockImpl {
    fn default() -> Self {
        Self::with_physical_time(Arc::new(SystemTimeSource))
    }
}

impl HybridClockImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_physical_time(physical: Arc<dyn PhysicalTime>) -> Self {
        Self {
            latest: AtomicU64::new(HybridTimestamp::MIN_VALUE.as_u64()),
            physical,
        }
    }

    fn physical_now(&self) -> HybridTimestamp {
        HybridTimestamp::new(self.physical.current_millis().max(1), 0)
    }

    fn advance(&self, floor: HybridTimestamp) -> HybridTimestamp {
        let mut current = self.latest.load(Ordering::Acquire);
        loop {
            let candidate = self
                .physical_now()
                .max(HybridTimestamp(current).tick())
                .max(floor);
            match self.latest.compare_exchange_weak(
                current,
                candidate.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}

impl HybridClock for HybridClockImpl {
    fn now(&self) -> HybridTimestamp {
        self.advance(HybridTimestamp(0))
    }

    fn update(&self, request_time: HybridTimestamp) -> HybridTimestamp {
        self.advance(request_time.tick())
    }
}

/// Observable timestamp of one causal session. Only moves forward.
#[derive(Debug, Default)]
pub struct HybridTimestampTracker {
    timestamp: AtomicU64,
}

impl HybridTimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<HybridTimestamp> {
        match self.timestamp.load(Ordering::Acquire) {
            0 => None,
            raw => Some(HybridTimestamp(raw)),
        }
    }

    pub fn update(&self, ts: HybridTimestamp) {
        self.timestamp.fetch_max(ts.0, Ordering::AcqRel);
    }
}
