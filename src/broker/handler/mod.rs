use std::fmt::Debug;

use async_trait::async_trait;

use crate::protocol::Request;

mod api_versions;
mod cluster;
mod create_topics;
mod delete_topics;
mod fetch;
mod leader_and_isr;
mod list_offsets;
mod metadata;
mod produce;
mod stop_replica;
#[cfg(test)]
pub(crate) mod test;

/// Serves one request type. Per-item failures are embedded in the response; an `Err`
/// means the request as a whole could not be answered.
#[async_trait]
pub(crate) trait Handler<Req>: Debug
where
    Req: Request,
{
    async fn do_handle(&self, req: Req) -> anyhow::Result<Req::Response> {
        tracing::debug!(api = ?Req::KEY, "executing request");
        self.handle(req, Req::Response::default()).await
    }

    async fn handle(&self, req: Req, res: Req::Response) -> anyhow::Result<Req::Response>;
}
