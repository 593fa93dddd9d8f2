use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Record;

/// Hook that derives commit metadata from a record. The returned string is
/// attached to the offset-commit entry produced for that record.
pub type RecordMetadataFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// What to do when an asynchronous offset commit reports failure.
///
/// Recovery applies to the per-record commit handle only; a timed-out
/// commit is never retried, since the original commit may still land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRecovery {
    /// Resubmit the same commit, sleeping `backoff` between attempts, up
    /// to `max_attempts` submissions in total.
    Retry { max_attempts: u32, backoff: Duration },
    /// Surface the failure to the caller immediately.
    Fail,
}

impl Default for CommitRecovery {
    fn default() -> Self {
        CommitRecovery::Retry {
            max_attempts: 10,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Settings recognized by the consumer actor. Start from `default()` and
/// chain `with_*` calls; everything not covered here (brokers, group id
/// registration, offset reset, ...) belongs to the underlying client's
/// own configuration.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Cadence of the periodic poll source.
    pub poll_interval: Duration,
    /// Timeout handed to each `poll` call on the client.
    pub poll_timeout: Duration,
    /// Bound on how long a per-record commit waits for its result.
    pub commit_timeout: Duration,
    pub commit_recovery: CommitRecovery,
    /// Consumer group id exposed on commit handles, when known.
    pub group_id: Option<String>,
    pub record_metadata: Option<RecordMetadataFn>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            commit_timeout: Duration::from_secs(15),
            commit_recovery: CommitRecovery::default(),
            group_id: None,
            record_metadata: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    pub fn with_commit_recovery(mut self, commit_recovery: CommitRecovery) -> Self {
        self.commit_recovery = commit_recovery;
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_record_metadata(
        mut self,
        record_metadata: impl Fn(&Record) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.record_metadata = Some(Arc::new(record_metadata));
        self
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("commit_timeout", &self.commit_timeout)
            .field("commit_recovery", &self.commit_recovery)
            .field("group_id", &self.group_id)
            .field("record_metadata", &self.record_metadata.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ConsumerConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_commit_timeout(Duration::from_secs(1))
            .with_commit_recovery(CommitRecovery::Fail)
            .with_group_id("group-a");

        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.commit_timeout, Duration::from_secs(1));
        assert_eq!(config.commit_recovery, CommitRecovery::Fail);
        assert_eq!(config.group_id.as_deref(), Some("group-a"));
    }
}
