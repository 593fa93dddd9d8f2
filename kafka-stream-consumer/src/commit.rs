use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::actor::Request;
use crate::config::CommitRecovery;
use crate::error::{ConsumerError, Result};
use crate::types::{OffsetAndMetadata, Partition, Record};

/// An offset-commit request travelling through the actor: the offsets to
/// commit and the slot the result is delivered through.
pub(crate) struct CommitRequest {
    pub offsets: BTreeMap<Partition, OffsetAndMetadata>,
    pub responder: oneshot::Sender<Result<()>>,
}

/// Entry point for commits originating from records: a clone of the
/// request queue plus the commit settings captured at startup.
#[derive(Clone)]
pub(crate) struct CommitSink {
    requests: mpsc::UnboundedSender<Request>,
    commit_timeout: Duration,
    commit_recovery: CommitRecovery,
}

impl CommitSink {
    pub fn new(
        requests: mpsc::UnboundedSender<Request>,
        commit_timeout: Duration,
        commit_recovery: CommitRecovery,
    ) -> Self {
        Self {
            requests,
            commit_timeout,
            commit_recovery,
        }
    }
}

impl fmt::Debug for CommitSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitSink")
            .field("commit_timeout", &self.commit_timeout)
            .field("commit_recovery", &self.commit_recovery)
            .finish_non_exhaustive()
    }
}

/// Commit handle attached to every fetched record. Committing records the
/// offset *after* the record, so a restarted consumer resumes at the next
/// unprocessed position.
#[derive(Debug, Clone)]
pub struct CommittableOffset {
    partition: Partition,
    offset_and_metadata: OffsetAndMetadata,
    group_id: Option<Arc<str>>,
    sink: CommitSink,
}

impl CommittableOffset {
    pub(crate) fn new(
        partition: Partition,
        offset_and_metadata: OffsetAndMetadata,
        group_id: Option<Arc<str>>,
        sink: CommitSink,
    ) -> Self {
        Self {
            partition,
            offset_and_metadata,
            group_id,
            sink,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset_and_metadata(&self) -> &OffsetAndMetadata {
        &self.offset_and_metadata
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// Submits the commit and waits for its result, bounded by the
    /// configured commit timeout. A timeout does not cancel the commit
    /// already in flight; it only stops waiting for it. Failed commits
    /// are resubmitted according to the configured recovery policy.
    pub async fn commit(&self) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let result = self.submit_once().await;
            match result {
                Err(ConsumerError::CommitFailed(error)) => {
                    if let CommitRecovery::Retry {
                        max_attempts,
                        backoff,
                    } = self.sink.commit_recovery
                    {
                        if attempts < max_attempts {
                            warn!(
                                partition = %self.partition,
                                attempt = attempts,
                                error = %error,
                                "offset commit failed, resubmitting"
                            );
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    }
                    return Err(ConsumerError::CommitFailed(error));
                }
                other => return other,
            }
        }
    }

    async fn submit_once(&self) -> Result<()> {
        let (responder, result) = oneshot::channel();
        let offsets = BTreeMap::from([(self.partition.clone(), self.offset_and_metadata.clone())]);
        self.sink
            .requests
            .send(Request::Commit(CommitRequest { offsets, responder }))
            .map_err(|_| ConsumerError::Shutdown)?;
        match tokio::time::timeout(self.sink.commit_timeout, result).await {
            Err(_) => Err(ConsumerError::CommitTimeout(self.sink.commit_timeout)),
            Ok(Err(_)) => Err(ConsumerError::Shutdown),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

/// A fetched record together with its commit handle.
#[derive(Debug, Clone)]
pub struct CommittableRecord {
    pub record: Record,
    pub offset: CommittableOffset,
}
