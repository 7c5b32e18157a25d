use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Largest chunk read from the backend and sent as one binary frame.
const READ_CHUNK: usize = 16 * 1024;

/// Time bounds for an established bridge.
#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    /// A backend that accepts no bytes for this long ends the bridge.
    pub backend_write_timeout: Duration,
    /// How long the client gets to receive the closing frame once the
    /// client-to-backend direction has ended.
    pub close_grace: Duration,
}

impl Default for BridgeLimits {
    fn default() -> Self {
        Self {
            backend_write_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(1),
        }
    }
}

/// Byte stream to a backend console.
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> BackendIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedBackend = Box<dyn BackendIo>;

/// Opens streams to backend consoles.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedBackend>;
}

/// Plain TCP [`BackendConnector`] with a per-attempt timeout and a bounded
/// number of attempts.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl TcpConnector {
    /// `attempts` is clamped to at least one.
    pub fn new(connect_timeout: Duration, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            connect_timeout,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    async fn connect_once(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 3, Duration::from_millis(250))
    }
}

#[async_trait]
impl BackendConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedBackend> {
        let mut attempt = 1;
        loop {
            match self.connect_once(host, port).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(host, port, attempt, "backend connected");
                    return Ok(Box::new(stream));
                }
                Err(err) if attempt < self.attempts => {
                    tracing::warn!(host, port, attempt, %err, "backend connect failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Failure of one half of an established bridge.
#[derive(Debug, Error)]
pub enum StreamFailure {
    #[error("client read failed: {0}")]
    ClientRead(String),
    #[error("client write failed: {0}")]
    ClientWrite(String),
    #[error("backend read failed: {0}")]
    BackendRead(io::Error),
    #[error("backend write failed: {0}")]
    BackendWrite(io::Error),
    #[error("relay task ended abnormally: {0}")]
    Task(String),
}

#[derive(Debug)]
pub enum BridgeEnd {
    ClientClosed,
    BackendClosed,
    Failed(StreamFailure),
}

#[derive(Debug)]
pub struct BridgeSummary {
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub end: BridgeEnd,
}

#[derive(Default)]
struct Counters {
    to_backend: AtomicU64,
    to_client: AtomicU64,
}

/// Relay bytes between a client WebSocket and a backend stream until either
/// side ends.
///
/// Each direction runs in its own task and the first to finish decides the
/// [`BridgeEnd`]. When the backend side ends first the client-side task is
/// aborted. When the client side ends first the backend-side task is told to
/// send the client a close frame and gets `close_grace` to do so, so a
/// client-initiated close completes its handshake. Either way every half is
/// dropped before this returns.
pub async fn bridge<C, E>(client: C, backend: BoxedBackend, limits: BridgeLimits) -> BridgeSummary
where
    C: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let counters = Arc::new(Counters::default());
    let (client_tx, client_rx) = client.split();
    let (backend_rx, backend_tx) = tokio::io::split(backend);
    let (stop_tx, stop_rx) = oneshot::channel();

    let mut up = tokio::spawn(client_to_backend(
        client_rx,
        backend_tx,
        Arc::clone(&counters),
        limits.backend_write_timeout,
    ));
    let mut down = tokio::spawn(backend_to_client(
        backend_rx,
        client_tx,
        Arc::clone(&counters),
        stop_rx,
    ));

    let finished = tokio::select! {
        result = &mut up => {
            let _ = stop_tx.send(());
            if tokio::time::timeout(limits.close_grace, &mut down).await.is_err() {
                down.abort();
            }
            result
        }
        result = &mut down => {
            up.abort();
            result
        }
    };

    let end = finished.unwrap_or_else(|err| BridgeEnd::Failed(StreamFailure::Task(err.to_string())));

    BridgeSummary {
        bytes_to_backend: counters.to_backend.load(Ordering::Relaxed),
        bytes_to_client: counters.to_client.load(Ordering::Relaxed),
        end,
    }
}

/// Client frames to backend bytes. Binary payloads pass through as-is, text
/// payloads as their UTF-8 bytes; ping and pong are not console data.
///
/// While a backend write is pending the client is not polled, so each write
/// is bounded by `write_timeout`.
async fn client_to_backend<R, E, W>(
    mut client: R,
    mut backend: W,
    counters: Arc<Counters>,
    write_timeout: Duration,
) -> BridgeEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = client.next().await {
        let payload = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(err) => return BridgeEnd::Failed(StreamFailure::ClientRead(err.to_string())),
        };
        if payload.is_empty() {
            continue;
        }

        match tokio::time::timeout(write_timeout, write_chunk(&mut backend, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return BridgeEnd::Failed(StreamFailure::BackendWrite(err)),
            Err(_) => {
                return BridgeEnd::Failed(StreamFailure::BackendWrite(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("backend accepted no data for {write_timeout:?}"),
                )))
            }
        }
        counters
            .to_backend
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
    }

    let _ = backend.shutdown().await;
    BridgeEnd::ClientClosed
}

async fn write_chunk<W: AsyncWrite + Unpin>(backend: &mut W, payload: &[u8]) -> io::Result<()> {
    backend.write_all(payload).await?;
    backend.flush().await
}

/// Backend bytes to client binary frames. Backend EOF, or a signal on `stop`,
/// is announced to the client with a close frame.
async fn backend_to_client<R, W, E>(
    mut backend: R,
    mut client: W,
    counters: Arc<Counters>,
    mut stop: oneshot::Receiver<()>,
) -> BridgeEnd
where
    R: AsyncRead + Unpin,
    W: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            read = backend.read(&mut buf) => read,
            _ = &mut stop => {
                // The caller keeps the other direction's end; this one only
                // finishes the close handshake.
                let _ = client.send(Message::Close(None)).await;
                return BridgeEnd::ClientClosed;
            }
        };

        let n = match read {
            Ok(0) => {
                let _ = client.send(Message::Close(None)).await;
                return BridgeEnd::BackendClosed;
            }
            Ok(n) => n,
            Err(err) => return BridgeEnd::Failed(StreamFailure::BackendRead(err)),
        };

        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
        if let Err(err) = client.send(frame).await {
            return BridgeEnd::Failed(StreamFailure::ClientWrite(err.to_string()));
        }
        counters.to_client.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    const NO_STALL: Duration = Duration::from_secs(5);

    fn frames(items: Vec<Result<Message, String>>) -> impl Stream<Item = Result<Message, String>> + Unpin {
        stream::iter(items)
    }

    /// A client sink that hands every frame to the returned receiver.
    fn recording_sink() -> (
        impl Sink<Message, Error = Infallible> + Unpin,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, frame: Message| async move {
            let _ = tx.send(frame);
            Ok::<_, Infallible>(tx)
        });
        (Box::pin(sink), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut sent = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            sent.push(frame);
        }
        sent
    }

    // -----------------------------------------------------------------------
    // client -> backend
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn client_frames_reach_backend_as_bytes() {
        let (backend, mut far_end) = tokio::io::duplex(1024);
        let counters = Arc::new(Counters::default());

        let end = client_to_backend(
            frames(vec![
                Ok(Message::Binary(Bytes::from_static(b"RFB 003.008\n"))),
                Ok(Message::Ping(Bytes::from_static(b"p"))),
                Ok(Message::Text("ok".into())),
                Ok(Message::Binary(Bytes::new())),
                Ok(Message::Close(None)),
                Ok(Message::Binary(Bytes::from_static(b"after close"))),
            ]),
            backend,
            Arc::clone(&counters),
            NO_STALL,
        )
        .await;

        assert!(matches!(end, BridgeEnd::ClientClosed));
        let mut received = Vec::new();
        far_end.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"RFB 003.008\nok");
        assert_eq!(counters.to_backend.load(Ordering::Relaxed), 14);
    }

    #[tokio::test]
    async fn client_stream_end_shuts_backend_down() {
        let (backend, mut far_end) = tokio::io::duplex(64);
        let end = client_to_backend(
            frames(vec![Ok(Message::Binary(Bytes::from_static(b"x")))]),
            backend,
            Arc::new(Counters::default()),
            NO_STALL,
        )
        .await;

        assert!(matches!(end, BridgeEnd::ClientClosed));
        let mut received = Vec::new();
        far_end.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"x");
    }

    #[tokio::test]
    async fn client_read_error_fails_the_bridge() {
        let (backend, _far_end) = tokio::io::duplex(64);
        let end = client_to_backend(
            frames(vec![Err("connection reset".to_string())]),
            backend,
            Arc::new(Counters::default()),
            NO_STALL,
        )
        .await;

        assert!(matches!(end, BridgeEnd::Failed(StreamFailure::ClientRead(msg)) if msg == "connection reset"));
    }

    #[tokio::test]
    async fn backend_write_error_fails_the_bridge() {
        let (backend, far_end) = tokio::io::duplex(64);
        drop(far_end);
        let end = client_to_backend(
            frames(vec![Ok(Message::Binary(Bytes::from_static(b"lost")))]),
            backend,
            Arc::new(Counters::default()),
            NO_STALL,
        )
        .await;

        assert!(matches!(end, BridgeEnd::Failed(StreamFailure::BackendWrite(_))));
    }

    #[tokio::test]
    async fn stalled_backend_write_times_out() {
        // The far end stays open but is never read, so the 64-byte pipe fills.
        let (backend, _far_end) = tokio::io::duplex(64);
        let started = std::time::Instant::now();

        let end = client_to_backend(
            frames(vec![Ok(Message::Binary(Bytes::from(vec![0u8; 4096])))]),
            backend,
            Arc::new(Counters::default()),
            Duration::from_millis(50),
        )
        .await;

        match end {
            BridgeEnd::Failed(StreamFailure::BackendWrite(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected a backend write timeout, got {other:?}"),
        }
        assert!(started.elapsed() < NO_STALL);
    }

    // -----------------------------------------------------------------------
    // backend -> client
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn backend_bytes_reach_client_then_close() {
        let (backend, mut far_end) = tokio::io::duplex(1024);
        far_end.write_all(b"login: ").await.unwrap();
        drop(far_end);

        let counters = Arc::new(Counters::default());
        let (sink, mut rx) = recording_sink();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let end = backend_to_client(backend, sink, Arc::clone(&counters), stop_rx).await;

        assert!(matches!(end, BridgeEnd::BackendClosed));
        let sent = drain(&mut rx);
        assert_eq!(sent.last(), Some(&Message::Close(None)));
        let payload: Vec<u8> = sent
            .iter()
            .filter_map(|m| match m {
                Message::Binary(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(payload, b"login: ");
        assert_eq!(counters.to_client.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn stop_signal_sends_close_to_an_idle_client() {
        // The backend is silent; only the stop signal can end this pump.
        let (backend, _far_end) = tokio::io::duplex(64);
        let (sink, mut rx) = recording_sink();
        let (stop_tx, stop_rx) = oneshot::channel();

        let pump = tokio::spawn(backend_to_client(
            backend,
            sink,
            Arc::new(Counters::default()),
            stop_rx,
        ));
        stop_tx.send(()).unwrap();
        tokio::time::timeout(NO_STALL, pump).await.unwrap().unwrap();

        assert_eq!(drain(&mut rx), vec![Message::Close(None)]);
    }

    // -----------------------------------------------------------------------
    // TcpConnector
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tcp_connector_reaches_listening_backend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector::new(Duration::from_secs(1), 1, Duration::ZERO);
        let stream = connector.connect("127.0.0.1", port).await;

        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tcp_connector_gives_up_after_bounded_attempts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = TcpConnector::new(Duration::from_secs(1), 3, Duration::from_millis(50));
        let started = std::time::Instant::now();
        let result = connector.connect("127.0.0.1", port).await;

        assert!(result.is_err());
        // Two retry delays separate three attempts.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn tcp_connector_always_makes_one_attempt() {
        let connector = TcpConnector::new(Duration::from_secs(1), 0, Duration::ZERO);
        assert_eq!(connector.attempts, 1);
    }
}
