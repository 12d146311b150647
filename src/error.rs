use thiserror::Error;

use crate::log::LogError;
use crate::protocol::{BrokerId, ErrorCode};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Failures of partition-level operations. Each one maps onto the error code that is
/// embedded in the response slot of the affected item.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown topic or partition {topic}/{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("broker {broker} is not the leader for {topic}/{partition}")]
    NotLeaderForPartition {
        topic: String,
        partition: i32,
        broker: BrokerId,
    },

    #[error("partition {topic}/{partition} is already registered")]
    DuplicatePartition { topic: String, partition: i32 },

    #[error("replication factor {requested} exceeds {available} available brokers")]
    InvalidReplicationFactor { requested: i16, available: usize },

    #[error("this broker is not the controller")]
    NotController,

    #[error("unsupported timestamp {0}")]
    UnsupportedTimestamp(i64),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::UnknownTopicOrPartition { .. } => ErrorCode::UnknownTopicOrPartition,
            BrokerError::NotLeaderForPartition { .. } => ErrorCode::NotLeaderForPartition,
            BrokerError::InvalidReplicationFactor { .. } => ErrorCode::InvalidReplicationFactor,
            BrokerError::NotController => ErrorCode::NotController,
            BrokerError::UnsupportedTimestamp(_) => ErrorCode::InvalidRequest,
            BrokerError::Log(LogError::OffsetOutOfRange { .. }) => ErrorCode::OffsetOutOfRange,
            BrokerError::DuplicatePartition { .. }
            | BrokerError::Log(_)
            | BrokerError::Internal(_) => ErrorCode::Unknown,
        }
    }

    /// The diagnostic message carried next to `Unknown` codes.
    pub fn message(&self) -> Option<String> {
        match self.code() {
            ErrorCode::Unknown => Some(format!("{:#}", self)),
            _ => None,
        }
    }
}

impl From<&BrokerError> for ErrorCode {
    fn from(err: &BrokerError) -> Self {
        err.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        let err = BrokerError::UnknownTopicOrPartition {
            topic: "t".into(),
            partition: 0,
        };
        assert_eq!(err.code(), ErrorCode::UnknownTopicOrPartition);
        assert_eq!(err.message(), None);

        let err = BrokerError::from(LogError::OffsetOutOfRange {
            offset: 10,
            oldest: 0,
            newest: 1,
        });
        assert_eq!(err.code(), ErrorCode::OffsetOutOfRange);

        let err = BrokerError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.code(), ErrorCode::Unknown);
        assert!(err.message().unwrap().contains("disk on fire"));
    }
}
