//! One authenticated, framed connection between two gateways.
//!
//! A [`Connection`] owns the write half of a stream; writes are serialized so
//! frames never interleave. The read half is driven by a task started with
//! [`spawn_reader`], which hands every frame to a [`FrameHandler`] in arrival
//! order and reports the end of the stream exactly once.

use crate::message::*;
use crate::transport::{BoxReader, BoxWriter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Authentication refused: {0}")]
    AuthRefused(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Snapshot of a connection for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Receives what arrives on a connection.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Called for each frame, in the order the peer sent them.
    async fn on_frame(&self, connection: &Arc<Connection>, frame: Frame);

    /// Called once when the read side ends on its own.
    ///
    /// `error` is `None` for a clean close by the peer. Not called when the
    /// local side closed the connection with [`Connection::close`].
    async fn on_closed(&self, connection: &Arc<Connection>, error: Option<WireError>);
}

/// A live, authenticated connection.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(peer: SocketAddr, writer: BoxWriter) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            connected_at: Utc::now(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            connected_at: self.connected_at,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one frame. Concurrent senders are serialized.
    pub async fn send(&self, frame: &Frame) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(WireError::ConnectionClosed)?;
        debug!(connection = %self.id, frame = frame.kind(), "Sending frame");
        write_frame(writer, frame).await
    }

    /// Close both directions. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.detach_reader() {
            task.abort();
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    fn detach_reader(&self) -> Option<JoinHandle<()>> {
        self.reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Start the read loop of `connection`, feeding `handler`.
pub fn spawn_reader(
    connection: &Arc<Connection>,
    mut reader: BoxReader,
    handler: Arc<dyn FrameHandler>,
) {
    let conn = Arc::clone(connection);
    let task = tokio::spawn(async move {
        let result = read_loop(&conn, &mut reader, &*handler).await;
        // Detach first: the handler may close the connection, which must not
        // abort the task that is running it.
        drop(conn.detach_reader());
        conn.closed.store(true, Ordering::Release);
        handler.on_closed(&conn, result.err()).await;
    });
    *connection
        .reader_task
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(task);
}

async fn read_loop(
    conn: &Arc<Connection>,
    reader: &mut BoxReader,
    handler: &dyn FrameHandler,
) -> Result<(), WireError> {
    loop {
        let frame = match read_frame(reader).await {
            Ok(f) => f,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!(connection = %conn.id, frame = frame.kind(), "Received frame");
        handler.on_frame(conn, frame).await;
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Ok(decode_frame(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{split, BoxStream};
    use tokio::net::{TcpListener, TcpStream};

    struct Collect {
        frames: tokio::sync::mpsc::UnboundedSender<Frame>,
        closed: tokio::sync::mpsc::UnboundedSender<bool>,
    }

    #[async_trait]
    impl FrameHandler for Collect {
        async fn on_frame(&self, _connection: &Arc<Connection>, frame: Frame) {
            let _ = self.frames.send(frame);
        }

        async fn on_closed(&self, _connection: &Arc<Connection>, error: Option<WireError>) {
            let _ = self.closed.send(error.is_none());
        }
    }

    async fn pair() -> (BoxStream, BoxStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (Box::new(client.unwrap()), Box::new(server.unwrap().0))
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_then_close() {
        let (a, b) = pair().await;
        let (_a_reader, a_writer) = split(a);
        let (b_reader, b_writer) = split(b);
        let sender = Connection::new("127.0.0.1:1".parse().unwrap(), a_writer);
        let receiver = Connection::new("127.0.0.1:2".parse().unwrap(), b_writer);

        let (ftx, mut frx) = tokio::sync::mpsc::unbounded_channel();
        let (ctx, mut crx) = tokio::sync::mpsc::unbounded_channel();
        spawn_reader(
            &receiver,
            b_reader,
            Arc::new(Collect {
                frames: ftx,
                closed: ctx,
            }),
        );

        for i in 0..5 {
            sender
                .send(&Frame::Timeout { id: format!("t-{i}") })
                .await
                .unwrap();
        }
        for i in 0..5 {
            let frame = frx.recv().await.unwrap();
            assert_eq!(frame.exchange_id(), Some(format!("t-{i}").as_str()));
        }

        sender.close().await;
        assert!(sender.is_closed());
        assert!(crx.recv().await.unwrap(), "clean close expected");
        assert!(receiver.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = pair().await;
        let (_reader, writer) = split(a);
        let conn = Connection::new("127.0.0.1:1".parse().unwrap(), writer);
        conn.close().await;
        conn.close().await;
        let err = conn
            .send(&Frame::Timeout { id: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes: &[u8] = &(MAX_FRAME_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut bytes).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        let bytes = encode_frame(&Frame::Timeout { id: "t-1".into() }).unwrap();
        let (head, tail) = bytes.split_at(6);
        let mut mock = tokio_test::io::Builder::new().read(head).read(tail).build();
        let frame = read_frame(&mut mock).await.unwrap();
        assert_eq!(frame, Frame::Timeout { id: "t-1".into() });
        assert!(matches!(
            read_frame(&mut mock).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_is_length_prefixed() {
        let frame = Frame::AuthReject {
            reason: "nope".into(),
        };
        let expected = encode_frame(&frame).unwrap();
        let mut mock = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut mock, &frame).await.unwrap();
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }
}
