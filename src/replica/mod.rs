//! Boundary to the replication layer.
//!
//! [`ReplicaService`] is the only way the coordination core talks to other
//! nodes. [`group::ReplicaGroup`] and [`group::LocalReplicaService`] are an
//! in-process stand-in for a partition's replication group: enough state to
//! record transaction decisions durably-by-contract, enforce lease terms and
//! apply index-build batches, without a consensus implementation behind it.

pub mod group;
pub mod messages;

use crate::error::PartTxError;
use crate::tx::partition::ClusterNode;
use async_trait::async_trait;
use messages::{BuildIndexRequest, FinishOutcome, FinishRequest};

pub use group::{LocalReplicaService, ReplicaGroup, TxStateMeta};
pub use messages::{ReplicatedCommand, TxOutcome};

#[async_trait]
pub trait ReplicaService: Send + Sync {
    /// Completes once the recipient's replication group has durably recorded
    /// the decision; returns the recorded decision.
    async fn finish(
        &self,
        recipient: &ClusterNode,
        request: FinishRequest,
    ) -> Result<FinishOutcome, PartTxError>;

    /// Completes once the batch's build command has been applied by the group.
    async fn build_index(
        &self,
        recipient: &ClusterNode,
        request: BuildIndexRequest,
    ) -> Result<(), PartTxError>;
}
