use std::fmt;

/// A single partition of a Kafka topic.
///
/// Ordered by topic name first, then partition number, so sets of
/// partitions iterate in a stable order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition_number)
    }
}

/// Identifies one logical consumer stream. Allocated by the stream
/// surface, opaque to the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one run of a stream over a partition. Streams must issue
/// strictly larger values each time the same partition is re-assigned to
/// them; the actor uses this to detect fetches left over from a previous
/// assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionStreamId(pub u64);

impl fmt::Display for PartitionStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw record as returned by the underlying client. Keys and values are
/// opaque bytes; deserialization belongs to the layers above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds, when present.
    pub timestamp: Option<i64>,
    pub headers: Option<Vec<(String, Option<Vec<u8>>)>>,
}

/// An offset to commit for one partition, with optional application
/// metadata attached to the commit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }
}

/// Why a fetch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// Records were fetched for the partition; the stream should request
    /// again once it has processed them.
    FetchedRecords,
    /// The partition was revoked (or the fetch was stale); the stream
    /// should end its current run over this partition. The chunk may
    /// still carry records buffered before the revocation.
    PartitionRevoked,
}

/// The completed side of a fetch: the record chunk and the reason the
/// fetch finished.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub records: Vec<crate::commit::CommittableRecord>,
    pub reason: FetchReason,
}

impl FetchResponse {
    pub(crate) fn fetched(records: Vec<crate::commit::CommittableRecord>) -> Self {
        Self {
            records,
            reason: FetchReason::FetchedRecords,
        }
    }

    pub(crate) fn revoked(records: Vec<crate::commit::CommittableRecord>) -> Self {
        Self {
            records,
            reason: FetchReason::PartitionRevoked,
        }
    }
}
