use kafka_protocol::ResponseError;

/// Error codes embedded in per-item response slots.
///
/// Every variant maps onto the Kafka wire code of the same meaning, so clients that
/// understand Kafka error codes can interpret responses without a translation table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    None,
    UnknownTopicOrPartition,
    InvalidReplicationFactor,
    NotLeaderForPartition,
    OffsetOutOfRange,
    TopicAlreadyExists,
    InvalidPartitions,
    NotController,
    InvalidRequest,
    Unknown,
}

impl ErrorCode {
    pub fn code(&self) -> i16 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::UnknownTopicOrPartition => ResponseError::UnknownTopicOrPartition.code(),
            ErrorCode::InvalidReplicationFactor => ResponseError::InvalidReplicationFactor.code(),
            ErrorCode::NotLeaderForPartition => ResponseError::NotLeaderOrFollower.code(),
            ErrorCode::OffsetOutOfRange => ResponseError::OffsetOutOfRange.code(),
            ErrorCode::TopicAlreadyExists => ResponseError::TopicAlreadyExists.code(),
            ErrorCode::InvalidPartitions => ResponseError::InvalidPartitions.code(),
            ErrorCode::NotController => ResponseError::NotController.code(),
            ErrorCode::InvalidRequest => ResponseError::InvalidRequest.code(),
            ErrorCode::Unknown => ResponseError::UnknownServerError.code(),
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::None
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
