use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::state::StateStore;
use crate::types::Partition;

const METRIC_PARTITIONS_REVOKED: &str = "kafka_stream_consumer_partitions_revoked_total";
const METRIC_PARTITIONS_ASSIGNED: &str = "kafka_stream_consumer_partitions_assigned_total";

/// Notifications delivered to registered streams whenever the group
/// assignment changes. Callbacks run synchronously on the thread driving
/// the client's poll; implementations should hand the sets off (for
/// example onto a channel) rather than block.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &BTreeSet<Partition>);
    fn on_partitions_revoked(&self, partitions: &BTreeSet<Partition>);
}

/// The reactor the client calls into from inside `poll`. Revocations are
/// applied to the state in one transaction: every fetch on a revoked
/// partition completes (with whatever was buffered for it), orphaned
/// buffers are dropped, and only then are the registered listeners told.
///
/// [`crate::ConsumerClient`] implementations must invoke these callbacks
/// for every rebalance observed during a poll call. These never touch the
/// client itself, so no gate re-entry is involved.
#[derive(Clone)]
pub struct RebalanceCallbacks {
    store: Arc<StateStore>,
}

impl RebalanceCallbacks {
    pub(crate) fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn partitions_revoked(&self, revoked: &BTreeSet<Partition>) {
        let (completions, listeners) = self
            .store
            .modify(|state| (state.revoke_partitions(revoked), state.on_rebalances.clone()));

        let completed_fetches = completions.len();
        for (token, response) in completions {
            drop(token.send(response));
        }
        for listener in &listeners {
            listener.on_partitions_revoked(revoked);
        }

        metrics::counter!(METRIC_PARTITIONS_REVOKED).increment(revoked.len() as u64);
        info!(
            partitions = ?revoked,
            completed_fetches,
            "partitions revoked"
        );
    }

    pub fn partitions_assigned(&self, assigned: &BTreeSet<Partition>) {
        let listeners = self.store.modify(|state| {
            state.rebalance_finished();
            state.on_rebalances.clone()
        });
        for listener in &listeners {
            listener.on_partitions_assigned(assigned);
        }

        metrics::counter!(METRIC_PARTITIONS_ASSIGNED).increment(assigned.len() as u64);
        info!(partitions = ?assigned, "partitions assigned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConsumerState;
    use crate::types::{FetchReason, FetchResponse, PartitionStreamId, StreamId};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(&'static str, Vec<Partition>)>>,
    }

    impl RebalanceListener for RecordingListener {
        fn on_partitions_assigned(&self, partitions: &BTreeSet<Partition>) {
            self.events
                .lock()
                .unwrap()
                .push(("assigned", partitions.iter().cloned().collect()));
        }

        fn on_partitions_revoked(&self, partitions: &BTreeSet<Partition>) {
            self.events
                .lock()
                .unwrap()
                .push(("revoked", partitions.iter().cloned().collect()));
        }
    }

    #[test]
    fn fetches_complete_before_listeners_run() {
        let store = Arc::new(StateStore::new());
        let callbacks = RebalanceCallbacks::new(Arc::clone(&store));
        let listener = Arc::new(RecordingListener::default());
        store.modify(|state: &mut ConsumerState| {
            state.on_rebalances.push(listener.clone());
            state.streaming = true;
        });

        let partition = Partition::new("t", 0);
        let (token, mut rx) = oneshot::channel::<FetchResponse>();
        store.modify(|state| {
            state.install_fetch(&partition, StreamId(1), PartitionStreamId(1), token)
        });

        let revoked = BTreeSet::from([partition.clone()]);
        callbacks.partitions_revoked(&revoked);

        // By the time the listener observed the revocation, the fetch had
        // already been completed.
        let response = rx.try_recv().expect("fetch completed");
        assert_eq!(response.reason, FetchReason::PartitionRevoked);
        let events = listener.events.lock().unwrap();
        assert_eq!(events.as_slice(), &[("revoked", vec![partition.clone()])]);
        assert!(store.read(|s| s.rebalancing));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let store = Arc::new(StateStore::new());
        let callbacks = RebalanceCallbacks::new(Arc::clone(&store));

        let order = Arc::new(Mutex::new(Vec::new()));
        struct Tagged {
            tag: u32,
            order: Arc<Mutex<Vec<u32>>>,
        }
        impl RebalanceListener for Tagged {
            fn on_partitions_assigned(&self, _partitions: &BTreeSet<Partition>) {
                self.order.lock().unwrap().push(self.tag);
            }
            fn on_partitions_revoked(&self, _partitions: &BTreeSet<Partition>) {}
        }

        for tag in 0..3 {
            let listener = Arc::new(Tagged {
                tag,
                order: Arc::clone(&order),
            });
            store.modify(|state| state.on_rebalances.push(listener));
        }

        callbacks.partitions_assigned(&BTreeSet::from([Partition::new("t", 0)]));
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
        assert!(!store.read(|s| s.rebalancing));
    }
}
