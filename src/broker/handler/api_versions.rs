use async_trait::async_trait;
use kafka_protocol::messages as kafka;
use kafka_protocol::protocol::Message;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{ApiKey, ApiVersion, ApiVersionsRequest, ApiVersionsResponse};

fn api_version<T: Message>(key: ApiKey) -> ApiVersion {
    ApiVersion {
        api_key: key as i16,
        min_version: T::VERSIONS.min,
        max_version: T::VERSIONS.max,
    }
}

#[async_trait]
impl Handler<ApiVersionsRequest> for Broker {
    async fn handle(
        &self,
        _req: ApiVersionsRequest,
        mut res: ApiVersionsResponse,
    ) -> anyhow::Result<ApiVersionsResponse> {
        res.api_keys = vec![
            api_version::<kafka::ProduceRequest>(ApiKey::ProduceKey),
            api_version::<kafka::FetchRequest>(ApiKey::FetchKey),
            api_version::<kafka::ListOffsetsRequest>(ApiKey::ListOffsetsKey),
            api_version::<kafka::MetadataRequest>(ApiKey::MetadataKey),
            api_version::<kafka::LeaderAndIsrRequest>(ApiKey::LeaderAndIsrKey),
            api_version::<kafka::StopReplicaRequest>(ApiKey::StopReplicaKey),
            api_version::<kafka::ApiVersionsRequest>(ApiKey::ApiVersionsKey),
            api_version::<kafka::CreateTopicsRequest>(ApiKey::CreateTopicsKey),
            api_version::<kafka::DeleteTopicsRequest>(ApiKey::DeleteTopicsKey),
        ];
        Ok(res)
    }
}
