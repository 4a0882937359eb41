//! The sockets on both sides of a connection, plain or TLS.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::select;
use tokio_rustls::{client, server};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionError;
use crate::protocol::OutgoingBuffers;

/// A downstream or upstream socket.
///
/// Downstream starts [`Plain`](ProxyStream::Plain) and becomes
/// [`ServerTls`](ProxyStream::ServerTls) when bumped; the upstream of a bumped
/// connection is [`ClientTls`](ProxyStream::ClientTls).
#[derive(Debug)]
pub enum ProxyStream {
    Plain(TcpStream),
    ServerTls(Box<server::TlsStream<TcpStream>>),
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl ProxyStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, ProxyStream::Plain(_))
    }

    /// Writes every buffer in order and flushes.
    pub async fn write_buffers(&mut self, buffers: &OutgoingBuffers) -> io::Result<()> {
        for buffer in buffers {
            self.write_all(buffer).await?;
        }
        self.flush().await
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            ProxyStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            ProxyStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            ProxyStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            ProxyStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Runs a socket operation unless the connection is stopped first.
pub(crate) async fn until_shutdown<F, T, E>(token: &CancellationToken, operation: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ConnectionError>,
{
    select! {
        biased;
        () = token.cancelled() => Err(ConnectionError::Cancelled),
        result = operation => result.map_err(Into::into),
    }
}
