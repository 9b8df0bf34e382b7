use crate::hlc::{HybridClock, HybridTimestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Begin timestamp in the high 64 bits, node discriminator in the low 64.
/// Ordering follows the begin timestamp, so a smaller id is an older transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new(begin_ts: HybridTimestamp, node_discriminator: u32) -> Self {
        Self(Uuid::from_u64_pair(
            begin_ts.as_u64(),
            node_discriminator as u64,
        ))
    }

    pub fn begin_timestamp(&self) -> HybridTimestamp {
        HybridTimestamp::from_u64(self.0.as_u64_pair().0)
    }

    pub fn node_discriminator(&self) -> u32 {
        self.0.as_u64_pair().1 as u32
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable per-node discriminator derived from the node name.
pub fn node_discriminator(node_name: &str) -> u32 {
    let hash = blake3::hash(node_name.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Unique as long as the clock is monotonic and discriminators differ per node.
#[derive(Clone)]
pub struct TransactionIdGenerator {
    clock: Arc<dyn HybridClock>,
    discriminator: u32,
}

impl TransactionIdGenerator {
    pub fn new(clock: Arc<dyn HybridClock>, node_name: &str) -> Self {
        Self {
            clock,
            discriminator: node_discriminator(node_name),
        }
    }

    pub fn next(&self) -> TransactionId {
        TransactionId::new(self.clock.now(), self.discriminator)
    }

    pub fn discriminator(&self) -> u32 {
        self.discriminator
    }
}
