//! Stream abstraction so TLS can be layered under the framing.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// Any bidirectional byte stream the framing can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;
pub type BoxReader = ReadHalf<BoxStream>;
pub type BoxWriter = WriteHalf<BoxStream>;

/// Upgrades raw TCP streams to TLS.
///
/// Loading certificates and keys into a TLS context is left to the embedder;
/// the gateway only calls through this trait when a domain or listener is
/// configured with TLS material.
#[async_trait]
pub trait TlsProvider: Send + Sync + 'static {
    /// Client side of the TLS handshake.
    async fn connect(&self, stream: TcpStream, server_name: &str) -> std::io::Result<BoxStream>;

    /// Server side of the TLS handshake.
    async fn accept(&self, stream: TcpStream) -> std::io::Result<BoxStream>;
}

/// Split a stream into independently owned halves.
pub fn split(stream: BoxStream) -> (BoxReader, BoxWriter) {
    tokio::io::split(stream)
}
