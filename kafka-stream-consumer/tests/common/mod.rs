use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use tokio::task::JoinHandle;

use kafka_stream_consumer::{
    start, CommitCompletion, ConsumerClient, ConsumerConfig, ConsumerError, ConsumerHandle,
    OffsetAndMetadata, Partition, RebalanceCallbacks, RebalanceListener, Record,
};

/// One step of a scripted poll. Rebalance steps fire the actor's
/// callbacks from inside `poll`, exactly like a real client; a `Records`
/// step ends the poll and returns its batch.
pub enum PollStep {
    Records(Vec<Record>),
    Revoke(Vec<Partition>),
    Assign(Vec<Partition>),
}

#[derive(Clone, Copy)]
pub enum CommitBehavior {
    Succeed,
    /// Fail this many commits with `RebalanceInProgress`, then succeed.
    FailTimes(usize),
    /// Keep the completion slot; the test releases it explicitly.
    Hold,
}

#[derive(Default)]
struct ScriptState {
    assignment: BTreeSet<Partition>,
    subscribed_topics: Vec<String>,
    poll_steps: VecDeque<PollStep>,
    pause_calls: Vec<BTreeSet<Partition>>,
    resume_calls: Vec<BTreeSet<Partition>>,
    commits: Vec<BTreeMap<Partition, OffsetAndMetadata>>,
    commit_behavior: Option<CommitBehavior>,
    held_commits: Vec<CommitCompletion>,
}

/// In-memory stand-in for the Kafka client, shared between the actor and
/// the test so the test can script polls and inspect calls.
#[derive(Clone)]
pub struct ScriptedClient {
    callbacks: RebalanceCallbacks,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedClient {
    pub fn new(callbacks: RebalanceCallbacks) -> Self {
        Self {
            callbacks,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn set_assignment(&self, partitions: impl IntoIterator<Item = Partition>) {
        self.state.lock().unwrap().assignment = partitions.into_iter().collect();
    }

    pub fn push_step(&self, step: PollStep) {
        self.state.lock().unwrap().poll_steps.push_back(step);
    }

    pub fn push_records(&self, records: Vec<Record>) {
        self.push_step(PollStep::Records(records));
    }

    pub fn set_commit_behavior(&self, behavior: CommitBehavior) {
        self.state.lock().unwrap().commit_behavior = Some(behavior);
    }

    pub fn pause_calls(&self) -> Vec<BTreeSet<Partition>> {
        self.state.lock().unwrap().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<BTreeSet<Partition>> {
        self.state.lock().unwrap().resume_calls.clone()
    }

    pub fn commits(&self) -> Vec<BTreeMap<Partition, OffsetAndMetadata>> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed_topics.clone()
    }

    /// Completes every held commit successfully, as a late client
    /// callback would.
    pub fn release_held_commits(&self) {
        let held = std::mem::take(&mut self.state.lock().unwrap().held_commits);
        for completion in held {
            drop(completion.send(Ok(())));
        }
    }
}

#[async_trait]
impl ConsumerClient for ScriptedClient {
    fn subscribe(&self, topics: &[String]) -> kafka_stream_consumer::Result<()> {
        self.state.lock().unwrap().subscribed_topics = topics.to_vec();
        Ok(())
    }

    fn subscribe_pattern(&self, pattern: &str) -> kafka_stream_consumer::Result<()> {
        self.state.lock().unwrap().subscribed_topics = vec![pattern.to_string()];
        Ok(())
    }

    fn assign(&self, partitions: &BTreeSet<Partition>) -> kafka_stream_consumer::Result<()> {
        self.state.lock().unwrap().assignment = partitions.clone();
        Ok(())
    }

    fn unsubscribe(&self) -> kafka_stream_consumer::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.subscribed_topics.clear();
        state.assignment.clear();
        Ok(())
    }

    fn assignment(&self) -> kafka_stream_consumer::Result<BTreeSet<Partition>> {
        Ok(self.state.lock().unwrap().assignment.clone())
    }

    fn pause(&self, partitions: &BTreeSet<Partition>) -> kafka_stream_consumer::Result<()> {
        self.state.lock().unwrap().pause_calls.push(partitions.clone());
        Ok(())
    }

    fn resume(&self, partitions: &BTreeSet<Partition>) -> kafka_stream_consumer::Result<()> {
        self.state
            .lock()
            .unwrap()
            .resume_calls
            .push(partitions.clone());
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> kafka_stream_consumer::Result<Vec<Record>> {
        loop {
            let step = self.state.lock().unwrap().poll_steps.pop_front();
            match step {
                None => return Ok(Vec::new()),
                Some(PollStep::Records(records)) => return Ok(records),
                Some(PollStep::Revoke(partitions)) => {
                    let revoked: BTreeSet<Partition> = partitions.into_iter().collect();
                    {
                        let mut state = self.state.lock().unwrap();
                        for partition in &revoked {
                            state.assignment.remove(partition);
                        }
                    }
                    self.callbacks.partitions_revoked(&revoked);
                }
                Some(PollStep::Assign(partitions)) => {
                    let assigned: BTreeSet<Partition> = partitions.into_iter().collect();
                    self.state
                        .lock()
                        .unwrap()
                        .assignment
                        .extend(assigned.iter().cloned());
                    self.callbacks.partitions_assigned(&assigned);
                }
            }
        }
    }

    fn commit(
        &self,
        offsets: &BTreeMap<Partition, OffsetAndMetadata>,
        completion: CommitCompletion,
    ) {
        enum Outcome {
            Complete(kafka_stream_consumer::Result<()>),
            Hold,
        }
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.commits.push(offsets.clone());
            match state.commit_behavior {
                None | Some(CommitBehavior::Succeed) => Outcome::Complete(Ok(())),
                Some(CommitBehavior::FailTimes(0)) => Outcome::Complete(Ok(())),
                Some(CommitBehavior::FailTimes(remaining)) => {
                    state.commit_behavior = Some(CommitBehavior::FailTimes(remaining - 1));
                    Outcome::Complete(Err(ConsumerError::CommitFailed(
                        KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress),
                    )))
                }
                Some(CommitBehavior::Hold) => Outcome::Hold,
            }
        };
        match outcome {
            Outcome::Complete(result) => {
                drop(completion.send(result));
            }
            Outcome::Hold => {
                self.state.lock().unwrap().held_commits.push(completion);
            }
        }
    }
}

/// Listener that records every notification it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(&'static str, Vec<Partition>)>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<(&'static str, Vec<Partition>)> {
        self.events.lock().unwrap().clone()
    }
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

/// Periodic polling is effectively disabled; tests drive polls through
/// `poll_now`.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig::new()
        .with_poll_interval(Duration::from_secs(3600))
        .with_commit_timeout(Duration::from_secs(1))
        .with_commit_recovery(kafka_stream_consumer::CommitRecovery::Fail)
}

/// Opt-in actor traces: run with `RUST_LOG=kafka_stream_consumer=debug`.
fn init_test_logging() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

pub fn start_actor(config: ConsumerConfig) -> (ConsumerHandle, ScriptedClient, JoinHandle<()>) {
    init_test_logging();
    let mut client_slot = None;
    let (handle, join) = start(config, |callbacks| {
        let client = ScriptedClient::new(callbacks);
        client_slot = Some(client.clone());
        Ok(client)
    })
    .expect("actor starts");
    (handle, client_slot.expect("client factory ran"), join)
}

pub fn tp(topic: &str, partition_number: i32) -> Partition {
    Partition::new(topic, partition_number)
}

pub fn record(topic: &str, partition_number: i32, offset: i64) -> Record {
    Record {
        partition: tp(topic, partition_number),
        offset,
        key: Some(format!("key-{offset}").into_bytes()),
        value: Some(format!("value-{offset}").into_bytes()),
        timestamp: None,
        headers: None,
    }
}
