use crate::error::PartTxError;
use crate::index::BATCH_SIZE;
use std::time::Duration;

/// Runtime configuration for one parttx node.
#[derive(Debug, Clone)]
pub struct PartTxConfig {
    pub node_name: String,
    /// Upper bound on index-build batches executing at the same time.
    pub index_build_threads: usize,
    pub index_build_batch_size: usize,
    pub index_build_shutdown_grace_ms: u64,
    pub finish_timeout_ms: u64,
    pub build_index_timeout_ms: u64,
    pub lock_wait_timeout_ms: u64,
    pub max_active_transactions: usize,
    /// Read-only transactions read this far behind `now()`.
    pub read_only_lag_ms: u64,
}

impl Default for PartTxConfig {
    fn default() -> Self {
        Self {
            node_name: "node".into(),
            index_build_threads: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            index_build_batch_size: BATCH_SIZE,
            index_build_shutdown_grace_ms: 10_000,
            finish_timeout_ms: 5_000,
            build_index_timeout_ms: 30_000,
            lock_wait_timeout_ms: 5_000,
            max_active_transactions: 65_536,
            read_only_lag_ms: 0,
        }
    }
}

impl PartTxConfig {
    /// Small pool and short timeouts, for local clusters and tests.
    pub fn development() -> Self {
        Self {
            index_build_threads: 2,
            index_build_shutdown_grace_ms: 1_000,
            finish_timeout_ms: 1_000,
            build_index_timeout_ms: 2_000,
            lock_wait_timeout_ms: 500,
            max_active_transactions: 4_096,
            ..Self::default()
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub fn validate(&self) -> Result<(), PartTxError> {
        if self.node_name.trim().is_empty() {
            return Err(invalid("node_name must not be empty"));
        }
        if self.index_build_threads == 0 {
            return Err(invalid("index_build_threads must be > 0"));
        }
        if self.index_build_batch_size == 0 || self.index_build_batch_size > BATCH_SIZE {
            return Err(invalid(&format!(
                "index_build_batch_size must be in 1..={BATCH_SIZE}"
            )));
        }
        if self.finish_timeout_ms == 0
            || self.build_index_timeout_ms == 0
            || self.lock_wait_timeout_ms == 0
        {
            return Err(invalid("timeouts must be > 0"));
        }
        if self.max_active_transactions == 0 {
            return Err(invalid("max_active_transactions must be > 0"));
        }
        Ok(())
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }

    pub fn build_index_timeout(&self) -> Duration {
        Duration::from_millis(self.build_index_timeout_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn index_build_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.index_build_shutdown_grace_ms)
    }
}

fn invalid(message: &str) -> PartTxError {
    PartTxError::InvalidConfig {
        message: message.to_string(),
    }
}
