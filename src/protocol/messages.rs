//! Typed request and response bodies for every API the broker serves.
//!
//! Field names follow the Kafka message definitions so the mapping onto the wire schema
//! stays obvious, but the shapes are trimmed to what the broker acts on.

use std::net::SocketAddr;

use uuid::Uuid;

use crate::membership::Member;
use crate::protocol::{ErrorCode, RecordBatch};
use crate::protocol::{ApiKey, BrokerId, Request};

/// Timestamp sentinel asking for the next offset to be written.
pub const LATEST_TIMESTAMP: i64 = -1;
/// Timestamp sentinel asking for the first offset still retained.
pub const EARLIEST_TIMESTAMP: i64 = -2;

// ApiVersions

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiVersionsRequest {
    pub client_software_name: Option<String>,
    pub client_software_version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiVersionsResponse {
    pub error_code: ErrorCode,
    pub api_keys: Vec<ApiVersion>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

impl Request for ApiVersionsRequest {
    const KEY: ApiKey = ApiKey::ApiVersionsKey;
    type Response = ApiVersionsResponse;

    fn error_response(&self, error: ErrorCode) -> ApiVersionsResponse {
        ApiVersionsResponse {
            error_code: error,
            api_keys: Vec::new(),
        }
    }
}

// CreateTopics

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTopicsRequest {
    pub topics: Vec<CreatableTopic>,
    pub timeout_ms: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatableTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
}

impl CreatableTopic {
    pub fn new(name: impl Into<String>, num_partitions: i32, replication_factor: i16) -> Self {
        Self {
            name: name.into(),
            num_partitions,
            replication_factor,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTopicsResponse {
    pub topics: Vec<CreatableTopicResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatableTopicResult {
    pub name: String,
    pub topic_id: Uuid,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub num_partitions: i32,
    pub replication_factor: i16,
}

impl Request for CreateTopicsRequest {
    const KEY: ApiKey = ApiKey::CreateTopicsKey;
    type Response = CreateTopicsResponse;

    fn error_response(&self, error: ErrorCode) -> CreateTopicsResponse {
        CreateTopicsResponse {
            topics: self
                .topics
                .iter()
                .map(|t| CreatableTopicResult {
                    name: t.name.clone(),
                    error_code: error,
                    num_partitions: t.num_partitions,
                    replication_factor: t.replication_factor,
                    ..Default::default()
                })
                .collect(),
        }
    }
}

// DeleteTopics

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteTopicsRequest {
    pub topic_names: Vec<String>,
    pub timeout_ms: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteTopicsResponse {
    pub responses: Vec<DeletableTopicResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletableTopicResult {
    pub name: String,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
}

impl Request for DeleteTopicsRequest {
    const KEY: ApiKey = ApiKey::DeleteTopicsKey;
    type Response = DeleteTopicsResponse;

    fn error_response(&self, error: ErrorCode) -> DeleteTopicsResponse {
        DeleteTopicsResponse {
            responses: self
                .topic_names
                .iter()
                .map(|name| DeletableTopicResult {
                    name: name.clone(),
                    error_code: error,
                    error_message: None,
                })
                .collect(),
        }
    }
}

// Produce

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub acks: i16,
    pub timeout_ms: i32,
    pub topic_data: Vec<TopicProduceData>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicProduceData {
    pub name: String,
    pub partition_data: Vec<PartitionProduceData>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionProduceData {
    pub index: i32,
    pub records: RecordBatch,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub responses: Vec<TopicProduceResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicProduceResponse {
    pub name: String,
    pub partition_responses: Vec<PartitionProduceResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionProduceResponse {
    pub index: i32,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
}

impl Request for ProduceRequest {
    const KEY: ApiKey = ApiKey::ProduceKey;
    type Response = ProduceResponse;

    fn error_response(&self, error: ErrorCode) -> ProduceResponse {
        ProduceResponse {
            responses: self
                .topic_data
                .iter()
                .map(|t| TopicProduceResponse {
                    name: t.name.clone(),
                    partition_responses: t
                        .partition_data
                        .iter()
                        .map(|p| PartitionProduceResponse {
                            index: p.index,
                            error_code: error,
                            error_message: None,
                            base_offset: -1,
                            log_append_time_ms: -1,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

// Fetch

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// The broker id of the follower issuing the fetch, or [`BrokerId::NONE`] for consumers.
    pub replica_id: BrokerId,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopic>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            replica_id: BrokerId::NONE,
            max_wait_ms: 0,
            min_bytes: 0,
            topics: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchPartition {
    pub partition: i32,
    /// The leader epoch the fetching replica believes is current, or -1 when unchecked.
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub partition_max_bytes: i32,
}

impl Default for FetchPartition {
    fn default() -> Self {
        Self {
            partition: 0,
            current_leader_epoch: -1,
            fetch_offset: 0,
            partition_max_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub responses: Vec<FetchableTopicResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchableTopicResponse {
    pub topic: String,
    pub partitions: Vec<PartitionData>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionData {
    pub partition_index: i32,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub records: Vec<RecordBatch>,
}

impl Request for FetchRequest {
    const KEY: ApiKey = ApiKey::FetchKey;
    type Response = FetchResponse;

    fn error_response(&self, error: ErrorCode) -> FetchResponse {
        FetchResponse {
            responses: self
                .topics
                .iter()
                .map(|t| FetchableTopicResponse {
                    topic: t.topic.clone(),
                    partitions: t
                        .partitions
                        .iter()
                        .map(|p| PartitionData {
                            partition_index: p.partition,
                            error_code: error,
                            high_watermark: -1,
                            log_start_offset: -1,
                            ..Default::default()
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

// ListOffsets

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsRequest {
    pub replica_id: BrokerId,
    pub topics: Vec<ListOffsetsTopic>,
}

impl Default for ListOffsetsRequest {
    fn default() -> Self {
        Self {
            replica_id: BrokerId::NONE,
            topics: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsPartition {
    pub partition_index: i32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsResponse {
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: ErrorCode,
    pub timestamp: i64,
    pub offset: i64,
}

impl Request for ListOffsetsRequest {
    const KEY: ApiKey = ApiKey::ListOffsetsKey;
    type Response = ListOffsetsResponse;

    fn error_response(&self, error: ErrorCode) -> ListOffsetsResponse {
        ListOffsetsResponse {
            topics: self
                .topics
                .iter()
                .map(|t| ListOffsetsTopicResponse {
                    name: t.name.clone(),
                    partitions: t
                        .partitions
                        .iter()
                        .map(|p| ListOffsetsPartitionResponse {
                            partition_index: p.partition_index,
                            error_code: error,
                            timestamp: -1,
                            offset: -1,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

// Metadata

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRequest {
    /// Topics to describe; `None` or an empty list describes every topic.
    pub topics: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub brokers: Vec<MetadataResponseBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: BrokerId,
    pub topics: Vec<MetadataResponseTopic>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponseBroker {
    pub node_id: BrokerId,
    pub host: String,
    pub port: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponseTopic {
    pub error_code: ErrorCode,
    pub name: String,
    pub topic_id: Uuid,
    pub partitions: Vec<MetadataResponsePartition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponsePartition {
    pub error_code: ErrorCode,
    pub partition_index: i32,
    pub leader_id: BrokerId,
    pub leader_epoch: i32,
    pub replica_nodes: Vec<BrokerId>,
    pub isr_nodes: Vec<BrokerId>,
}

impl Request for MetadataRequest {
    const KEY: ApiKey = ApiKey::MetadataKey;
    type Response = MetadataResponse;

    fn error_response(&self, error: ErrorCode) -> MetadataResponse {
        MetadataResponse {
            controller_id: BrokerId::NONE,
            topics: self
                .topics
                .iter()
                .flatten()
                .map(|name| MetadataResponseTopic {
                    error_code: error,
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

// LeaderAndIsr

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderAndIsrRequest {
    pub controller_id: BrokerId,
    pub partition_states: Vec<LeaderAndIsrPartitionState>,
}

/// A leadership assignment for one partition as decided by the controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAndIsrPartitionState {
    pub topic_name: String,
    pub partition_index: i32,
    pub leader: BrokerId,
    /// Monotonic version of this assignment; bumped on every change.
    pub leader_epoch: i32,
    pub isr: Vec<BrokerId>,
    pub replicas: Vec<BrokerId>,
}

impl Default for LeaderAndIsrPartitionState {
    fn default() -> Self {
        Self {
            topic_name: String::new(),
            partition_index: 0,
            leader: BrokerId::NONE,
            leader_epoch: 0,
            isr: Vec::new(),
            replicas: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderAndIsrResponse {
    pub error_code: ErrorCode,
    pub partition_errors: Vec<LeaderAndIsrPartitionError>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderAndIsrPartitionError {
    pub topic_name: String,
    pub partition_index: i32,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
}

impl Request for LeaderAndIsrRequest {
    const KEY: ApiKey = ApiKey::LeaderAndIsrKey;
    type Response = LeaderAndIsrResponse;

    fn error_response(&self, error: ErrorCode) -> LeaderAndIsrResponse {
        LeaderAndIsrResponse {
            error_code: error,
            partition_errors: self
                .partition_states
                .iter()
                .map(|p| LeaderAndIsrPartitionError {
                    topic_name: p.topic_name.clone(),
                    partition_index: p.partition_index,
                    error_code: error,
                    error_message: None,
                })
                .collect(),
        }
    }
}

// StopReplica

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopReplicaRequest {
    pub controller_id: BrokerId,
    pub delete_partitions: bool,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopReplicaResponse {
    pub error_code: ErrorCode,
    pub partition_errors: Vec<StopReplicaPartitionError>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopReplicaPartitionError {
    pub topic_name: String,
    pub partition_index: i32,
    pub error_code: ErrorCode,
}

impl Request for StopReplicaRequest {
    const KEY: ApiKey = ApiKey::StopReplicaKey;
    type Response = StopReplicaResponse;

    fn error_response(&self, error: ErrorCode) -> StopReplicaResponse {
        StopReplicaResponse {
            error_code: error,
            partition_errors: self
                .partitions
                .iter()
                .map(|p| StopReplicaPartitionError {
                    topic_name: p.topic.clone(),
                    partition_index: p.partition,
                    error_code: error,
                })
                .collect(),
        }
    }
}

// Cluster-internal RPCs. They borrow the API keys Kafka assigns to its own quorum and
// broker registration protocols, but their bodies are this broker's own.

// Vote

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: BrokerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Zero when the receiver could not take part in the election at all.
    pub term: u64,
    pub vote_granted: bool,
}

impl Request for VoteRequest {
    const KEY: ApiKey = ApiKey::VoteKey;
    type Response = VoteResponse;
}

// AppendEntries

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: BrokerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// One entry of the replicated metadata log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader to commit entries of earlier terms.
    Noop,
    Command(Vec<u8>),
    /// The full server set, effective as soon as it is appended.
    Config(Vec<QuorumServer>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumServer {
    pub id: BrokerId,
    pub addr: SocketAddr,
    pub voter: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Zero when the receiver could not process the request at all.
    pub term: u64,
    pub success: bool,
    /// On success the last index now matching the leader, otherwise the highest index the
    /// leader may try next.
    pub match_index: u64,
}

impl Request for AppendEntriesRequest {
    const KEY: ApiKey = ApiKey::BeginQuorumEpochKey;
    type Response = AppendEntriesResponse;
}

// BrokerRegistration

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistrationRequest {
    pub member: Member,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistrationResponse {
    pub members: Vec<Member>,
}

impl Request for BrokerRegistrationRequest {
    const KEY: ApiKey = ApiKey::BrokerRegistrationKey;
    type Response = BrokerRegistrationResponse;
}

// BrokerHeartbeat

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHeartbeatRequest {
    /// The sender as it sees itself.
    pub member: Member,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHeartbeatResponse {
    pub member: Member,
    pub members: Vec<Member>,
}

impl Request for BrokerHeartbeatRequest {
    const KEY: ApiKey = ApiKey::BrokerHeartbeatKey;
    type Response = BrokerHeartbeatResponse;
}

// UnregisterBroker

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterBrokerRequest {
    pub member: Member,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterBrokerResponse {}

impl Request for UnregisterBrokerRequest {
    const KEY: ApiKey = ApiKey::UnregisterBrokerKey;
    type Response = UnregisterBrokerResponse;
}
