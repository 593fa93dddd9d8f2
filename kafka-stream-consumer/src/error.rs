use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer is not subscribed")]
    NotSubscribed,

    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("offset commit did not complete within {0:?}")]
    CommitTimeout(Duration),

    #[error("offset commit failed: {0}")]
    CommitFailed(KafkaError),

    #[error("consumer actor has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
