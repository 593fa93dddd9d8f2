use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{OffsetAndMetadata, Partition, Record};

/// Completion slot for an asynchronous commit. The client delivers `Ok`
/// or [`crate::ConsumerError::CommitFailed`] from whatever thread the
/// commit finishes on.
pub type CommitCompletion = oneshot::Sender<Result<()>>;

/// The narrow interface the actor consumes the underlying consumer
/// through. All calls are issued under the client gate, one at a time.
///
/// The crate ships [`crate::RdKafkaConsumerClient`]; alternative
/// implementations (in-memory clients for tests, other bindings) must
/// uphold two contracts:
///
/// * `poll` invokes the [`crate::RebalanceCallbacks`] handed out at
///   construction, synchronously, for every rebalance observed during
///   the call: revocations before the partitions are lost, assignments
///   after they are acquired.
/// * `commit` returns without waiting; the result arrives later through
///   the completion slot.
#[async_trait]
pub trait ConsumerClient: Send + Sync + 'static {
    fn subscribe(&self, topics: &[String]) -> Result<()>;

    fn subscribe_pattern(&self, pattern: &str) -> Result<()>;

    fn assign(&self, partitions: &BTreeSet<Partition>) -> Result<()>;

    fn unsubscribe(&self) -> Result<()>;

    fn assignment(&self) -> Result<BTreeSet<Partition>>;

    fn pause(&self, partitions: &BTreeSet<Partition>) -> Result<()>;

    fn resume(&self, partitions: &BTreeSet<Partition>) -> Result<()>;

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>>;

    fn commit(&self, offsets: &BTreeMap<Partition, OffsetAndMetadata>, completion: CommitCompletion);
}
