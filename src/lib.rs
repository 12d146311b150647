pub mod broker;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod log;
pub mod membership;
pub mod protocol;

use tokio_util::sync::CancellationToken;

use crate::broker::server::Server;
use crate::broker::Broker;
use crate::cluster::Cluster;

#[macro_use]
extern crate serde_derive;

/// Runs a broker from the configuration at `config_path` until `token` is cancelled.
pub async fn hedda<P: AsRef<std::path::Path>>(
    config_path: P,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let config = config::config(config_path)?;
    let server = Server::bind(config.broker.addr()).await?;
    let broker = Broker::start(config.broker, &Cluster::tcp()).await?;
    let server = tokio::spawn(server.run(broker.clone()));

    token.cancelled().await;
    tracing::info!("shutting down");
    broker.shutdown().await?;
    server.await??;
    Ok(())
}
