//! The typed request/response model exchanged with the broker.

use std::fmt::Debug;

use derive_more::Display;
pub use kafka_protocol::messages::ApiKey;

pub use codec::BrokerClient;
pub use error::ErrorCode;
pub use messages::*;
pub use records::{Record, RecordBatch};

pub mod codec;
mod error;
mod messages;
mod records;

#[derive(
    Copy, Clone, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BrokerId(pub i32);

impl BrokerId {
    /// No broker, e.g. a partition without a leader.
    pub const NONE: BrokerId = BrokerId(-1);

    pub fn is_none(&self) -> bool {
        self.0 < 0
    }
}

/// Ties a request body to its API key and response type.
pub trait Request: Default + Debug + Send + 'static {
    const KEY: ApiKey;
    type Response: Default + Debug + Send;

    /// A response answering every item of this request with `error`, sent when the
    /// request as a whole could not be served.
    fn error_response(&self, _error: ErrorCode) -> Self::Response {
        Self::Response::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    ApiVersions(ApiVersionsRequest),
    CreateTopics(CreateTopicsRequest),
    DeleteTopics(DeleteTopicsRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    Metadata(MetadataRequest),
    LeaderAndIsr(LeaderAndIsrRequest),
    StopReplica(StopReplicaRequest),
    Vote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    BrokerRegistration(BrokerRegistrationRequest),
    BrokerHeartbeat(BrokerHeartbeatRequest),
    UnregisterBroker(UnregisterBrokerRequest),
}

impl RequestKind {
    pub fn api_key(&self) -> ApiKey {
        match self {
            RequestKind::ApiVersions(_) => ApiVersionsRequest::KEY,
            RequestKind::CreateTopics(_) => CreateTopicsRequest::KEY,
            RequestKind::DeleteTopics(_) => DeleteTopicsRequest::KEY,
            RequestKind::Produce(_) => ProduceRequest::KEY,
            RequestKind::Fetch(_) => FetchRequest::KEY,
            RequestKind::ListOffsets(_) => ListOffsetsRequest::KEY,
            RequestKind::Metadata(_) => MetadataRequest::KEY,
            RequestKind::LeaderAndIsr(_) => LeaderAndIsrRequest::KEY,
            RequestKind::StopReplica(_) => StopReplicaRequest::KEY,
            RequestKind::Vote(_) => VoteRequest::KEY,
            RequestKind::AppendEntries(_) => AppendEntriesRequest::KEY,
            RequestKind::BrokerRegistration(_) => BrokerRegistrationRequest::KEY,
            RequestKind::BrokerHeartbeat(_) => BrokerHeartbeatRequest::KEY,
            RequestKind::UnregisterBroker(_) => UnregisterBrokerRequest::KEY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseKind {
    ApiVersions(ApiVersionsResponse),
    CreateTopics(CreateTopicsResponse),
    DeleteTopics(DeleteTopicsResponse),
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    ListOffsets(ListOffsetsResponse),
    Metadata(MetadataResponse),
    LeaderAndIsr(LeaderAndIsrResponse),
    StopReplica(StopReplicaResponse),
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    BrokerRegistration(BrokerRegistrationResponse),
    BrokerHeartbeat(BrokerHeartbeatResponse),
    UnregisterBroker(UnregisterBrokerResponse),
}

macro_rules! request_from {
    ($($variant:ident => $req:ty, $res:ty);* $(;)?) => {
        $(
            impl From<$req> for RequestKind {
                fn from(req: $req) -> Self {
                    RequestKind::$variant(req)
                }
            }

            impl From<$res> for ResponseKind {
                fn from(res: $res) -> Self {
                    ResponseKind::$variant(res)
                }
            }

            impl TryFrom<ResponseKind> for $res {
                type Error = anyhow::Error;

                fn try_from(res: ResponseKind) -> anyhow::Result<Self> {
                    match res {
                        ResponseKind::$variant(res) => Ok(res),
                        other => Err(anyhow::anyhow!(
                            "expected {} response, got {:?}",
                            stringify!($variant),
                            other
                        )),
                    }
                }
            }
        )*
    };
}

request_from! {
    ApiVersions => ApiVersionsRequest, ApiVersionsResponse;
    CreateTopics => CreateTopicsRequest, CreateTopicsResponse;
    DeleteTopics => DeleteTopicsRequest, DeleteTopicsResponse;
    Produce => ProduceRequest, ProduceResponse;
    Fetch => FetchRequest, FetchResponse;
    ListOffsets => ListOffsetsRequest, ListOffsetsResponse;
    Metadata => MetadataRequest, MetadataResponse;
    LeaderAndIsr => LeaderAndIsrRequest, LeaderAndIsrResponse;
    StopReplica => StopReplicaRequest, StopReplicaResponse;
    Vote => VoteRequest, VoteResponse;
    AppendEntries => AppendEntriesRequest, AppendEntriesResponse;
    BrokerRegistration => BrokerRegistrationRequest, BrokerRegistrationResponse;
    BrokerHeartbeat => BrokerHeartbeatRequest, BrokerHeartbeatResponse;
    UnregisterBroker => UnregisterBrokerRequest, UnregisterBrokerResponse;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

/// One inbound unit of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub body: RequestKind,
}

impl RequestFrame {
    pub fn new(correlation_id: i32, body: impl Into<RequestKind>) -> Self {
        let body = body.into();
        Self {
            header: RequestHeader {
                api_key: body.api_key() as i16,
                correlation_id,
                ..Default::default()
            },
            body,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub correlation_id: i32,
    pub payload: ResponseKind,
}

/// One outbound unit of a session, echoing the request's correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub body: ResponseBody,
}

impl ResponseFrame {
    pub fn new(correlation_id: i32, payload: ResponseKind) -> Self {
        Self {
            header: ResponseHeader { correlation_id },
            body: ResponseBody {
                correlation_id,
                payload,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_carries_api_key() {
        let frame = RequestFrame::new(7, MetadataRequest::default());
        assert_eq!(frame.header.api_key, ApiKey::MetadataKey as i16);
        assert_eq!(frame.header.correlation_id, 7);
    }

    #[test]
    fn response_downcast() {
        let res: ResponseKind = MetadataResponse::default().into();
        assert!(MetadataResponse::try_from(res.clone()).is_ok());
        assert!(FetchResponse::try_from(res).is_err());
    }

    #[test]
    fn frames_are_json_on_the_wire() -> anyhow::Result<()> {
        let frame = RequestFrame::new(3, ApiVersionsRequest::default());
        let json = serde_json::to_value(&frame)?;
        assert_eq!(json["header"]["correlation_id"], 3);
        assert_eq!(json["header"]["api_key"], ApiKey::ApiVersionsKey as i16);

        let back: RequestFrame = serde_json::from_value(json)?;
        assert!(matches!(back.body, RequestKind::ApiVersions(_)));
        Ok(())
    }
}
