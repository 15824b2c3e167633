// Framed byte-stream transport.
//
// A `Transport` owns one connected stream wrapped in `FrameCodec`. Every
// send and receive is bounded by an absolute deadline that covers the whole
// frame, so a peer trickling partial frames cannot stretch a call past it.
// Connection establishment goes through the `Connect` trait so tests can
// substitute in-memory streams for TCP.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::error::Error;
use crate::message::Message;

/// Default DPM acquisition port.
pub const DEFAULT_PORT: u16 = 6802;

/// Grace period for an orderly shutdown before the stream is dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

// ── Stream abstraction ──────────────────────────────────────────────

/// Any bidirectional byte stream usable as a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens new streams to a DPM service.
pub trait Connect: Send + Sync + fmt::Debug {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, Error>>;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

/// TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

impl Connect for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream, Error>> {
        Box::pin(async move {
            let addr = self.peer();
            let stream = timeout(
                self.connect_timeout,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: millis(self.connect_timeout),
            })?
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })?;
            stream.set_nodelay(true)?;
            tracing::debug!(%addr, "TCP connection established");
            let boxed: BoxedStream = Box::new(stream);
            Ok(boxed)
        })
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// One framed connection. `None` once closed.
pub struct Transport {
    framed: Option<Framed<BoxedStream, FrameCodec>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Open a new stream through `connector`, bounded by `deadline`.
    pub async fn connect(connector: &dyn Connect, deadline: Instant) -> Result<Self, Error> {
        let budget = remaining(deadline);
        let stream = timeout_at(deadline, connector.connect())
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: millis(budget),
            })??;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: BoxedStream) -> Self {
        Self {
            framed: Some(Framed::new(stream, FrameCodec)),
        }
    }

    pub async fn send(&mut self, msg: Message, deadline: Instant) -> Result<(), Error> {
        let budget = remaining(deadline);
        let framed = self.framed.as_mut().ok_or(Error::SessionClosed)?;
        timeout_at(deadline, framed.send(msg))
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: millis(budget),
            })?
    }

    /// Receive exactly one message.
    pub async fn recv(&mut self, deadline: Instant) -> Result<Message, Error> {
        let budget = remaining(deadline);
        let framed = self.framed.as_mut().ok_or(Error::SessionClosed)?;
        match timeout_at(deadline, framed.next()).await {
            Err(_) => Err(Error::Timeout {
                timeout_ms: millis(budget),
            }),
            Ok(None) => Err(Error::ConnectionClosed),
            Ok(Some(result)) => result,
        }
    }

    /// Shut the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            let _ = timeout(CLOSE_GRACE, framed.get_mut().shutdown()).await;
        }
    }

    /// Drop the stream without an orderly shutdown.
    pub fn abort(&mut self) {
        self.framed = None;
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::status::Status;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn sends_and_receives_frames() {
        let (a, b) = duplex(4096);
        let mut client = Transport::from_stream(Box::new(a));
        let mut server = Transport::from_stream(Box::new(b));

        client.send(Message::ListClear, deadline(1000)).await.unwrap();
        assert_eq!(server.recv(deadline(1000)).await.unwrap(), Message::ListClear);

        let reply = Message::StatusReply {
            index: 0,
            status: Status::OK,
        };
        server.send(reply.clone(), deadline(1000)).await.unwrap();
        assert_eq!(client.recv(deadline(1000)).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn frames_are_length_prefixed_on_the_wire() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 1, 0x03])
            .read(&[0, 0, 0, 5, 0x82, 0xFF, 0xFF, 0x00, 0x00])
            .build();
        let mut transport = Transport::from_stream(Box::new(mock));

        transport.send(Message::ListStop, deadline(1000)).await.unwrap();
        assert_eq!(
            transport.recv(deadline(1000)).await.unwrap(),
            Message::StatusReply {
                index: crate::message::LIST_INDEX,
                status: Status::OK,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_does_not_extend_deadline() {
        let (a, mut b) = duplex(4096);
        let mut client = Transport::from_stream(Box::new(a));

        // Header promises 8 bytes; only one arrives.
        b.write_all(&[0, 0, 0, 8, 0x82]).await.unwrap();
        let err = client.recv(deadline(100)).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (a, b) = duplex(64);
        let mut client = Transport::from_stream(Box::new(a));
        drop(b);
        let err = client.recv(deadline(1000)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed), "{err}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = duplex(64);
        let mut client = Transport::from_stream(Box::new(a));
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        let err = client.send(Message::ListStop, deadline(100)).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }
}
