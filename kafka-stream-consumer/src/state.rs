use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::commit::{CommitRequest, CommittableRecord};
use crate::rebalance::RebalanceListener;
use crate::types::{FetchResponse, Partition, PartitionStreamId, StreamId};

/// Completer side of one outstanding fetch. Sending consumes the token,
/// so a fetch can never be completed twice.
pub(crate) type FetchToken = oneshot::Sender<FetchResponse>;

/// Everything the actor knows, in one value. Mutated only through
/// [`StateStore::modify`], by the dispatcher and by rebalance callbacks
/// running inside a poll.
#[derive(Default)]
pub(crate) struct ConsumerState {
    /// Outstanding fetches, at most one per `(partition, stream)`.
    pub fetches: BTreeMap<Partition, HashMap<StreamId, FetchToken>>,
    /// Largest partition-stream id seen per partition.
    pub partition_stream_ids: BTreeMap<Partition, PartitionStreamId>,
    /// Records fetched ahead of demand; entries are non-empty.
    pub records: BTreeMap<Partition, Vec<CommittableRecord>>,
    /// Commits parked while a rebalance is in progress.
    pub pending_commits: VecDeque<CommitRequest>,
    /// Listeners notified of every rebalance, in registration order.
    pub on_rebalances: Vec<Arc<dyn RebalanceListener>>,
    pub rebalancing: bool,
    pub subscribed: bool,
    pub streaming: bool,
}

/// What a poll integration decided: fetches to complete and commits to
/// replay, both executed by the caller after the state lock is released.
#[derive(Default)]
pub(crate) struct PollOutcome {
    pub completions: Vec<(FetchToken, FetchResponse)>,
    pub resumed_commits: Vec<CommitRequest>,
}

impl ConsumerState {
    /// Registers a fetch, returning any token that must be completed with
    /// `PartitionRevoked`: the incoming one if it is stale, or a previous
    /// token for the same `(partition, stream)` that it displaced.
    pub fn install_fetch(
        &mut self,
        partition: &Partition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
        token: FetchToken,
    ) -> Option<FetchToken> {
        let current = self
            .partition_stream_ids
            .get(partition)
            .copied()
            .unwrap_or_default();
        if current > partition_stream_id {
            // A newer run of this partition exists; the requesting stream
            // is finished with it. Any buffer left for the old run goes
            // with it.
            self.records.remove(partition);
            return Some(token);
        }
        self.partition_stream_ids
            .insert(partition.clone(), current.max(partition_stream_id));
        self.fetches
            .entry(partition.clone())
            .or_default()
            .insert(stream_id, token)
    }

    /// Applies a revocation: completes every fetch on a revoked partition
    /// (delivering buffered records when there are any) and drops buffers
    /// nobody is waiting for. Returns the completions to execute.
    pub fn revoke_partitions(
        &mut self,
        revoked: &BTreeSet<Partition>,
    ) -> Vec<(FetchToken, FetchResponse)> {
        self.rebalancing = true;
        let mut completions = Vec::new();
        for partition in revoked {
            let buffered = self.records.remove(partition).unwrap_or_default();
            if let Some(tokens) = self.fetches.remove(partition) {
                for token in tokens.into_values() {
                    completions.push((token, FetchResponse::revoked(buffered.clone())));
                }
            }
        }
        completions
    }

    pub fn rebalance_finished(&mut self) {
        self.rebalancing = false;
    }

    /// Merges the records returned by a poll with the buffers, completes
    /// every fetch that now has data, and releases pending commits if
    /// this poll observed the end of a rebalance.
    ///
    /// Buffered records precede newly polled ones in every delivered
    /// chunk, preserving broker order. When several streams hold fetches
    /// for the same partition, each receives the full chunk.
    pub fn integrate_poll(
        &mut self,
        was_rebalancing: bool,
        mut new_records: BTreeMap<Partition, Vec<CommittableRecord>>,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        if was_rebalancing && !self.rebalancing && !self.pending_commits.is_empty() {
            outcome.resumed_commits = self.pending_commits.drain(..).collect();
        }

        if self.fetches.is_empty() {
            for (partition, records) in new_records {
                if records.is_empty() {
                    continue;
                }
                self.records.entry(partition).or_default().extend(records);
            }
            return outcome;
        }

        let completable: Vec<Partition> = self
            .fetches
            .keys()
            .filter(|partition| {
                self.records.contains_key(*partition) || new_records.contains_key(*partition)
            })
            .cloned()
            .collect();

        for partition in completable {
            let mut chunk = self.records.remove(&partition).unwrap_or_default();
            chunk.extend(new_records.remove(&partition).unwrap_or_default());
            if chunk.is_empty() {
                continue;
            }
            if let Some(tokens) = self.fetches.remove(&partition) {
                for token in tokens.into_values() {
                    outcome
                        .completions
                        .push((token, FetchResponse::fetched(chunk.clone())));
                }
            }
        }

        for (partition, records) in new_records {
            if records.is_empty() {
                continue;
            }
            self.records.entry(partition).or_default().extend(records);
        }

        outcome
    }
}

/// Shared cell holding the [`ConsumerState`]. `modify` runs a transaction
/// under a short lock and hands back whatever actions the transaction
/// computed; callers execute those after the lock is gone, so nothing
/// that can suspend or call user code runs inside the critical section.
#[derive(Default)]
pub(crate) struct StateStore {
    inner: Mutex<ConsumerState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modify<T>(&self, f: impl FnOnce(&mut ConsumerState) -> T) -> T {
        let mut state = self.inner.lock().expect("consumer state lock poisoned");
        f(&mut state)
    }

    /// Advisory snapshot read. Decisions spanning a read and a write must
    /// go through `modify` instead.
    pub fn read<T>(&self, f: impl FnOnce(&ConsumerState) -> T) -> T {
        let state = self.inner.lock().expect("consumer state lock poisoned");
        f(&state)
    }
}
