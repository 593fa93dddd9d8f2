use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rdkafka::error::KafkaError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ConsumerClient;
use crate::commit::{CommitRequest, CommitSink, CommittableOffset, CommittableRecord};
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::gate::ClientGate;
use crate::poller;
use crate::rebalance::{RebalanceCallbacks, RebalanceListener};
use crate::state::StateStore;
use crate::types::{
    FetchResponse, OffsetAndMetadata, Partition, PartitionStreamId, Record, StreamId,
};

const METRIC_POLLS: &str = "kafka_stream_consumer_polls_total";
const METRIC_RECORDS_POLLED: &str = "kafka_stream_consumer_records_polled_total";
const METRIC_FETCHES_COMPLETED: &str = "kafka_stream_consumer_fetches_completed_total";
const METRIC_COMMITS_ISSUED: &str = "kafka_stream_consumer_commits_issued_total";
const METRIC_COMMITS_DEFERRED: &str = "kafka_stream_consumer_commits_deferred_total";

type Responder<T> = oneshot::Sender<Result<T>>;

/// One message on the actor's inbox. Producers enqueue and await the
/// result slot they passed along; only the dispatcher executes handlers.
pub(crate) enum Request {
    SubscribeTopics {
        topics: Vec<String>,
        responder: Responder<()>,
    },
    SubscribePattern {
        pattern: String,
        responder: Responder<()>,
    },
    Assign {
        partitions: BTreeSet<Partition>,
        responder: Responder<()>,
    },
    Unsubscribe {
        responder: Responder<()>,
    },
    Assignment {
        listener: Option<Arc<dyn RebalanceListener>>,
        responder: Responder<BTreeSet<Partition>>,
    },
    Fetch {
        partition: Partition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
        token: oneshot::Sender<FetchResponse>,
    },
    Commit(CommitRequest),
    Poll,
}

/// Starts the consumer actor: builds the state, hands the rebalance
/// callbacks to `make_client`, and spawns the dispatcher task plus the
/// periodic poll source. The factory shape mirrors how a client context
/// must exist before the client it belongs to.
pub fn start<C, F>(config: ConsumerConfig, make_client: F) -> Result<(ConsumerHandle, JoinHandle<()>)>
where
    C: ConsumerClient,
    F: FnOnce(RebalanceCallbacks) -> Result<C>,
{
    let store = Arc::new(StateStore::new());
    let callbacks = RebalanceCallbacks::new(Arc::clone(&store));
    let client = make_client(callbacks)?;

    let (request_tx, requests) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let _poller = poller::spawn(request_tx.clone(), config.poll_interval, shutdown.clone());

    let commit_sink = CommitSink::new(
        request_tx.clone(),
        config.commit_timeout,
        config.commit_recovery,
    );
    let actor = ConsumerActor {
        group_id: config.group_id.clone().map(Arc::from),
        config,
        gate: ClientGate::new(client),
        store,
        commit_sink,
        requests,
        shutdown: shutdown.clone(),
    };
    let handle = ConsumerHandle {
        requests: request_tx,
        shutdown,
    };
    Ok((handle, tokio::spawn(actor.run())))
}

/// Cloneable front door to the actor. Every method enqueues a request and
/// waits on its result slot; dropping the wait does not cancel the
/// request.
#[derive(Clone)]
pub struct ConsumerHandle {
    requests: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
}

impl ConsumerHandle {
    pub async fn subscribe(&self, topics: Vec<String>) -> Result<()> {
        if topics.is_empty() {
            return Err(ConsumerError::Kafka(KafkaError::Subscription(
                "topic list is empty".into(),
            )));
        }
        self.request(|responder| Request::SubscribeTopics { topics, responder })
            .await
    }

    pub async fn subscribe_pattern(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        self.request(|responder| Request::SubscribePattern { pattern, responder })
            .await
    }

    pub async fn assign(&self, partitions: BTreeSet<Partition>) -> Result<()> {
        if partitions.is_empty() {
            return Err(ConsumerError::Kafka(KafkaError::Subscription(
                "partition set is empty".into(),
            )));
        }
        self.request(|responder| Request::Assign {
            partitions,
            responder,
        })
        .await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.request(|responder| Request::Unsubscribe { responder })
            .await
    }

    /// Current assignment, or `NotSubscribed` before any subscribe or
    /// assign succeeded.
    pub async fn assignment(&self) -> Result<BTreeSet<Partition>> {
        self.request(|responder| Request::Assignment {
            listener: None,
            responder,
        })
        .await
    }

    /// Registers a stream for rebalance notifications and returns the
    /// current assignment. Fetching only starts once at least one stream
    /// has registered.
    pub async fn assignment_with_listener(
        &self,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<BTreeSet<Partition>> {
        self.request(|responder| Request::Assignment {
            listener: Some(listener),
            responder,
        })
        .await
    }

    /// Requests the next chunk of records for `partition` on behalf of a
    /// stream. Resolves with `FetchedRecords` once data is available, or
    /// with `PartitionRevoked` when the partition is gone (or the request
    /// was superseded) and the stream should end this run.
    pub async fn fetch(
        &self,
        partition: Partition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
    ) -> Result<FetchResponse> {
        let (token, response) = oneshot::channel();
        self.requests
            .send(Request::Fetch {
                partition,
                stream_id,
                partition_stream_id,
                token,
            })
            .map_err(|_| ConsumerError::Shutdown)?;
        response.await.map_err(|_| ConsumerError::Shutdown)
    }

    /// Commits the given offsets, waiting for the broker round trip. Held
    /// back and replayed automatically when a rebalance is in progress.
    pub async fn commit(&self, offsets: BTreeMap<Partition, OffsetAndMetadata>) -> Result<()> {
        let (responder, result) = oneshot::channel();
        self.requests
            .send(Request::Commit(CommitRequest { offsets, responder }))
            .map_err(|_| ConsumerError::Shutdown)?;
        result.await.map_err(|_| ConsumerError::Shutdown)?
    }

    /// Enqueues an immediate poll ahead of the periodic cadence.
    pub fn poll_now(&self) -> Result<()> {
        self.requests
            .send(Request::Poll)
            .map_err(|_| ConsumerError::Shutdown)
    }

    /// Stops the poll source and the dispatcher. Requests still queued are
    /// dropped; their callers observe `Shutdown`.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> Request) -> Result<T> {
        let (responder, result) = oneshot::channel();
        self.requests
            .send(build(responder))
            .map_err(|_| ConsumerError::Shutdown)?;
        result.await.map_err(|_| ConsumerError::Shutdown)?
    }
}

struct ConsumerActor<C> {
    config: ConsumerConfig,
    group_id: Option<Arc<str>>,
    gate: ClientGate<C>,
    store: Arc<StateStore>,
    commit_sink: CommitSink,
    requests: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
}

impl<C: ConsumerClient> ConsumerActor<C> {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.requests.recv() => request,
            };
            match request {
                Some(request) => self.dispatch(request).await,
                None => break,
            }
        }
        debug!("consumer actor stopped");
    }

    async fn dispatch(&self, request: Request) {
        match request {
            Request::SubscribeTopics { topics, responder } => {
                self.handle_subscribe_topics(topics, responder).await;
            }
            Request::SubscribePattern { pattern, responder } => {
                self.handle_subscribe_pattern(pattern, responder).await;
            }
            Request::Assign {
                partitions,
                responder,
            } => self.handle_assign(partitions, responder).await,
            Request::Unsubscribe { responder } => self.handle_unsubscribe(responder).await,
            Request::Assignment {
                listener,
                responder,
            } => self.handle_assignment(listener, responder).await,
            Request::Fetch {
                partition,
                stream_id,
                partition_stream_id,
                token,
            } => {
                self.handle_fetch(partition, stream_id, partition_stream_id, token)
                    .await;
            }
            Request::Commit(request) => self.handle_commit(request).await,
            Request::Poll => self.handle_poll().await,
        }
    }

    async fn handle_subscribe_topics(&self, topics: Vec<String>, responder: Responder<()>) {
        let result = {
            let client = self.gate.lock().await;
            client.subscribe(&topics)
        };
        match result {
            Ok(()) => {
                self.store.modify(|state| state.subscribed = true);
                info!(topics = ?topics, "subscribed to topics");
                drop(responder.send(Ok(())));
            }
            Err(error) => {
                drop(responder.send(Err(error)));
            }
        }
    }

    async fn handle_subscribe_pattern(&self, pattern: String, responder: Responder<()>) {
        let result = {
            let client = self.gate.lock().await;
            client.subscribe_pattern(&pattern)
        };
        match result {
            Ok(()) => {
                self.store.modify(|state| state.subscribed = true);
                info!(pattern, "subscribed to topic pattern");
                drop(responder.send(Ok(())));
            }
            Err(error) => {
                drop(responder.send(Err(error)));
            }
        }
    }

    async fn handle_assign(&self, partitions: BTreeSet<Partition>, responder: Responder<()>) {
        let result = {
            let client = self.gate.lock().await;
            client.assign(&partitions)
        };
        match result {
            Ok(()) => {
                self.store.modify(|state| state.subscribed = true);
                info!(partitions = ?partitions, "assigned partitions");
                drop(responder.send(Ok(())));
            }
            Err(error) => {
                drop(responder.send(Err(error)));
            }
        }
    }

    async fn handle_unsubscribe(&self, responder: Responder<()>) {
        let result = {
            let client = self.gate.lock().await;
            client.unsubscribe()
        };
        match result {
            Ok(()) => {
                self.store.modify(|state| state.subscribed = false);
                info!("unsubscribed");
                drop(responder.send(Ok(())));
            }
            Err(error) => {
                drop(responder.send(Err(error)));
            }
        }
    }

    async fn handle_assignment(
        &self,
        listener: Option<Arc<dyn RebalanceListener>>,
        responder: Responder<BTreeSet<Partition>>,
    ) {
        if !self.store.read(|state| state.subscribed) {
            drop(responder.send(Err(ConsumerError::NotSubscribed)));
            return;
        }
        let result = {
            let client = self.gate.lock().await;
            client.assignment()
        };
        match result {
            Ok(assigned) => {
                if let Some(listener) = listener {
                    self.store.modify(|state| {
                        state.on_rebalances.push(listener);
                        state.streaming = true;
                    });
                }
                drop(responder.send(Ok(assigned)));
            }
            Err(error) => {
                drop(responder.send(Err(error)));
            }
        }
    }

    async fn handle_fetch(
        &self,
        partition: Partition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
        token: oneshot::Sender<FetchResponse>,
    ) {
        let assigned = {
            let client = self.gate.lock().await;
            client.assignment()
        };
        let assigned = match assigned {
            Ok(assigned) => assigned,
            Err(error) => {
                warn!(%partition, %error, "assignment lookup failed, completing fetch as revoked");
                drop(token.send(FetchResponse::revoked(Vec::new())));
                return;
            }
        };
        if !assigned.contains(&partition) {
            drop(token.send(FetchResponse::revoked(Vec::new())));
            return;
        }

        let superseded = self.store.modify(|state| {
            state.install_fetch(&partition, stream_id, partition_stream_id, token)
        });
        if let Some(token) = superseded {
            drop(token.send(FetchResponse::revoked(Vec::new())));
        }
    }

    async fn handle_commit(&self, request: CommitRequest) {
        let immediate = self.store.modify(|state| {
            if state.rebalancing {
                state.pending_commits.push_back(request);
                None
            } else {
                Some(request)
            }
        });
        match immediate {
            Some(request) => self.issue_commit(request).await,
            None => {
                metrics::counter!(METRIC_COMMITS_DEFERRED).increment(1);
                debug!("commit deferred until rebalance completes");
            }
        }
    }

    async fn issue_commit(&self, request: CommitRequest) {
        metrics::counter!(METRIC_COMMITS_ISSUED).increment(1);
        let CommitRequest { offsets, responder } = request;
        let client = self.gate.lock().await;
        client.commit(&offsets, responder);
    }

    async fn handle_poll(&self) {
        let (subscribed, streaming, was_rebalancing) = self
            .store
            .read(|state| (state.subscribed, state.streaming, state.rebalancing));
        if !subscribed || !streaming {
            return;
        }
        metrics::counter!(METRIC_POLLS).increment(1);

        let polled = {
            let client = self.gate.lock().await;
            let assigned = match client.assignment() {
                Ok(assigned) => assigned,
                Err(error) => {
                    error!(%error, "assignment lookup failed, skipping poll");
                    return;
                }
            };
            let (requested, buffered) = self.store.read(|state| {
                (
                    state.fetches.keys().cloned().collect::<BTreeSet<_>>(),
                    state.records.keys().cloned().collect::<BTreeSet<_>>(),
                )
            });

            // Resume exactly the partitions with unsatisfied demand; hold
            // everything else back so the client fetches nothing for it.
            let resume: BTreeSet<Partition> = requested
                .intersection(&assigned)
                .filter(|partition| !buffered.contains(*partition))
                .cloned()
                .collect();
            let pause: BTreeSet<Partition> = assigned.difference(&resume).cloned().collect();

            if let Err(error) = client.pause(&pause) {
                error!(%error, "pausing partitions failed, skipping poll");
                return;
            }
            if let Err(error) = client.resume(&resume) {
                error!(%error, "resuming partitions failed, skipping poll");
                return;
            }

            // Rebalance callbacks run synchronously in here.
            match client.poll(self.config.poll_timeout).await {
                Ok(records) => records,
                Err(error) => {
                    error!(%error, "kafka poll failed");
                    return;
                }
            }
        };

        if !polled.is_empty() {
            metrics::counter!(METRIC_RECORDS_POLLED).increment(polled.len() as u64);
        }
        let new_records = self.committable_records(polled);
        let outcome = self
            .store
            .modify(|state| state.integrate_poll(was_rebalancing, new_records));

        let completed_fetches = outcome.completions.len();
        for (token, response) in outcome.completions {
            drop(token.send(response));
        }
        if completed_fetches > 0 {
            metrics::counter!(METRIC_FETCHES_COMPLETED).increment(completed_fetches as u64);
        }

        let replayed_commits = outcome.resumed_commits.len();
        for request in outcome.resumed_commits {
            self.issue_commit(request).await;
        }

        if completed_fetches > 0 || replayed_commits > 0 {
            debug!(completed_fetches, replayed_commits, "poll integrated");
        }
    }

    fn committable_records(
        &self,
        polled: Vec<Record>,
    ) -> BTreeMap<Partition, Vec<CommittableRecord>> {
        let mut grouped: BTreeMap<Partition, Vec<CommittableRecord>> = BTreeMap::new();
        for record in polled {
            let metadata = self
                .config
                .record_metadata
                .as_ref()
                .and_then(|derive| derive(&record));
            let offset = CommittableOffset::new(
                record.partition.clone(),
                OffsetAndMetadata {
                    offset: record.offset + 1,
                    metadata,
                },
                self.group_id.clone(),
                self.commit_sink.clone(),
            );
            grouped
                .entry(record.partition.clone())
                .or_default()
                .push(CommittableRecord { record, offset });
        }
        grouped
    }
}
