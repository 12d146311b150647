use std::net::SocketAddr;

use futures::{SinkExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::protocol::codec;

/// Frames buffered between a connection and its session.
const SESSION_BUFFER: usize = 32;

/// Accepts client and peer connections, running one request session per connection.
///
/// Binding comes before the broker starts, so peers that contact it while it is still
/// joining the cluster queue up instead of being refused.
pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections on behalf of `broker` until it shuts down.
    #[tracing::instrument(skip_all, fields(id = %broker.config.id))]
    pub async fn run(self, broker: Broker) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "listening");
        loop {
            tokio::select! {
                _ = broker.token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    tracing::debug!(%addr, "peer connected");
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        match serve(broker, stream).await {
                            Ok(()) => tracing::debug!(%addr, "peer disconnected"),
                            Err(e) => tracing::warn!(%addr, "session failed: {:#}", e),
                        }
                    });
                }
            }
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn serve(broker: Broker, stream: TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = codec::server(stream);
    let (req_tx, req_rx) = mpsc::channel(SESSION_BUFFER);
    let (res_tx, mut res_rx) = mpsc::channel(SESSION_BUFFER);

    let token = broker.token.clone();
    let read = async move {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = reader.try_next() => match frame? {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if req_tx.send(frame).await.is_err() {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    };
    let write = async move {
        while let Some(frame) = res_rx.recv().await {
            writer.send(frame).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(read, broker.run(req_rx, res_tx), write)?;
    Ok(())
}
