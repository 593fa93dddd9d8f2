use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::client::{CommitCompletion, ConsumerClient};
use crate::error::{ConsumerError, Result};
use crate::rebalance::RebalanceCallbacks;
use crate::types::{OffsetAndMetadata, Partition, Record};

/// librdkafka keeps handing out messages as long as any are queued; bound
/// a single drain so one poll cannot starve the actor.
const MAX_BATCH_RECORDS: usize = 1024;

/// [`ConsumerClient`] over an rdkafka [`BaseConsumer`]. The blocking poll
/// runs on the blocking thread pool; rebalance callbacks reach the actor
/// through the [`StreamingConsumerContext`] wired in at creation.
pub struct RdKafkaConsumerClient {
    consumer: Arc<BaseConsumer<StreamingConsumerContext>>,
}

impl RdKafkaConsumerClient {
    /// Creates the underlying consumer from an rdkafka `ClientConfig`.
    /// The caller is responsible for `bootstrap.servers`, `group.id` and
    /// friends; `enable.auto.commit` should be off, since commits flow
    /// through the actor.
    pub fn new(client_config: &ClientConfig, callbacks: RebalanceCallbacks) -> Result<Self> {
        let context = StreamingConsumerContext::new(callbacks);
        let consumer: BaseConsumer<StreamingConsumerContext> =
            client_config.create_with_context(context)?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl ConsumerClient for RdKafkaConsumerClient {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(Into::into)
    }

    fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        // librdkafka treats subscriptions starting with '^' as regexes.
        let pattern = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        self.consumer
            .subscribe(&[pattern.as_str()])
            .map_err(Into::into)
    }

    fn assign(&self, partitions: &BTreeSet<Partition>) -> Result<()> {
        self.consumer
            .assign(&partition_list(partitions))
            .map_err(Into::into)
    }

    fn unsubscribe(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>> {
        Ok(partition_set(&self.consumer.assignment()?))
    }

    fn pause(&self, partitions: &BTreeSet<Partition>) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .pause(&partition_list(partitions))
            .map_err(Into::into)
    }

    fn resume(&self, partitions: &BTreeSet<Partition>) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(Into::into)
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Record>> {
        let consumer = Arc::clone(&self.consumer);
        let batch = tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            let mut wait = timeout;
            while records.len() < MAX_BATCH_RECORDS {
                match consumer.poll(wait) {
                    None => break,
                    Some(Ok(message)) => {
                        records.push(to_record(&message));
                        // Drain whatever else is already queued locally.
                        wait = Duration::ZERO;
                    }
                    Some(Err(error)) => return Err(error),
                }
            }
            Ok(records)
        })
        .await;
        match batch {
            Ok(result) => result.map_err(Into::into),
            Err(join_error) => {
                error!(error = %join_error, "poll task failed");
                Err(ConsumerError::Shutdown)
            }
        }
    }

    fn commit(&self, offsets: &BTreeMap<Partition, OffsetAndMetadata>, completion: CommitCompletion) {
        let list = match commit_list(offsets) {
            Ok(list) => list,
            Err(error) => {
                drop(completion.send(Err(ConsumerError::CommitFailed(error))));
                return;
            }
        };
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            let result = consumer
                .commit(&list, CommitMode::Sync)
                .map_err(ConsumerError::CommitFailed);
            if completion.send(result).is_err() {
                debug!("commit finished after the caller stopped waiting");
            }
        });
    }
}

/// Bridges librdkafka's consumer callbacks into the actor: revocations
/// before partitions are lost, assignments after they are acquired, plus
/// client log lines routed into `tracing`.
pub struct StreamingConsumerContext {
    callbacks: RebalanceCallbacks,
}

impl StreamingConsumerContext {
    pub fn new(callbacks: RebalanceCallbacks) -> Self {
        Self { callbacks }
    }
}

impl ClientContext for StreamingConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Warning => warn!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!("librdkafka: {} {}", fac, log_message)
            }
            RDKafkaLogLevel::Debug => debug!("librdkafka: {} {}", fac, log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(%error, reason, "librdkafka error");
    }
}

impl ConsumerContext for StreamingConsumerContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(list) = rebalance {
            self.callbacks.partitions_revoked(&partition_set(list));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => self.callbacks.partitions_assigned(&partition_set(list)),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(error) => error!(%error, "rebalance failed"),
        }
    }
}

fn partition_set(list: &TopicPartitionList) -> BTreeSet<Partition> {
    list.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

fn partition_list(partitions: &BTreeSet<Partition>) -> TopicPartitionList {
    let mut list = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

fn commit_list(
    offsets: &BTreeMap<Partition, OffsetAndMetadata>,
) -> std::result::Result<TopicPartitionList, KafkaError> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (partition, entry) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(entry.offset),
        )?;
        if let Some(metadata) = &entry.metadata {
            if let Some(mut elem) =
                list.find_partition(partition.topic(), partition.partition_number())
            {
                elem.set_metadata(metadata.clone());
            }
        }
    }
    Ok(list)
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let headers = message.headers().map(|headers| {
        headers
            .iter()
            .map(|header| (header.key.to_string(), header.value.map(|value| value.to_vec())))
            .collect()
    });
    Record {
        partition: Partition::new(message.topic(), message.partition()),
        offset: message.offset(),
        key: message.key().map(|key| key.to_vec()),
        value: message.payload().map(|payload| payload.to_vec()),
        timestamp: message.timestamp().to_millis(),
        headers,
    }
}
