use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use futures::{SinkExt, TryStreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_serde::formats::SymmetricalJson;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::protocol::{RequestFrame, RequestKind, ResponseFrame, ResponseKind};

pub type FrameReader<T> =
    SymmetricallyFramed<FramedRead<OwnedReadHalf, LengthDelimitedCodec>, T, SymmetricalJson<T>>;
pub type FrameWriter<T> =
    SymmetricallyFramed<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>, T, SymmetricalJson<T>>;

fn reader<T>(r: OwnedReadHalf) -> FrameReader<T> {
    SymmetricallyFramed::new(
        FramedRead::new(r, LengthDelimitedCodec::new()),
        SymmetricalJson::default(),
    )
}

fn writer<T>(w: OwnedWriteHalf) -> FrameWriter<T> {
    SymmetricallyFramed::new(
        FramedWrite::new(w, LengthDelimitedCodec::new()),
        SymmetricalJson::default(),
    )
}

/// Splits an accepted connection into a stream of requests and a sink of responses.
pub fn server(stream: TcpStream) -> (FrameReader<RequestFrame>, FrameWriter<ResponseFrame>) {
    let (r, w) = stream.into_split();
    (reader(r), writer(w))
}

/// A single connection to a broker. Requests on one client are issued one at a time, so
/// every response is read back before the next request is written.
pub struct BrokerClient {
    addr: SocketAddr,
    correlation_id: AtomicI32,
    conn: Mutex<(FrameWriter<RequestFrame>, FrameReader<ResponseFrame>)>,
}

impl Debug for BrokerClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BrokerClient {{ addr: {} }}", self.addr)
    }
}

impl BrokerClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        Ok(Self {
            addr,
            correlation_id: AtomicI32::new(0),
            conn: Mutex::new((writer(w), reader(r))),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[tracing::instrument(skip(self, req), fields(addr = %self.addr))]
    pub async fn send(&self, req: impl Into<RequestKind>) -> anyhow::Result<ResponseKind> {
        let mut conn = self.conn.lock().await;
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame::new(correlation_id, req);
        tracing::trace!(?frame.header, "send client request");

        let (w, r) = &mut *conn;
        w.send(frame).await?;
        loop {
            let res = r
                .try_next()
                .await?
                .ok_or_else(|| anyhow::anyhow!("connection to {} closed", self.addr))?;

            // responses to abandoned requests are still in the stream
            if res.body.correlation_id < correlation_id {
                tracing::trace!(res.body.correlation_id, "skip stale response");
                continue;
            }
            if res.body.correlation_id != correlation_id {
                anyhow::bail!(
                    "correlation id mismatch: sent {}, received {}",
                    correlation_id,
                    res.body.correlation_id
                );
            }
            tracing::trace!(?res.header, "receive client response");
            return Ok(res.body.payload);
        }
    }
}
