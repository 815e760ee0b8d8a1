//! Stream sockets shared by the framed connectors
//!
//! Inside a Nitro enclave the parent and the enclave talk over vsock; in
//! simulation the same framing runs over TCP. [`Listener`] and [`Stream`]
//! hide which one is in use.

use crate::error::TransportError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Where a socket listens or connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketTarget {
    /// `host:port`
    Tcp(String),
    Vsock { cid: u32, port: u32 },
}

impl SocketTarget {
    pub fn tcp(host: &str, port: u16) -> Self {
        SocketTarget::Tcp(format!("{}:{}", host, port))
    }

    /// Any-CID vsock listener address
    #[cfg(target_os = "linux")]
    pub fn vsock_any(port: u32) -> Self {
        SocketTarget::Vsock {
            cid: nix::libc::VMADDR_CID_ANY,
            port,
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn vsock_any(port: u32) -> Self {
        SocketTarget::Vsock {
            cid: u32::MAX,
            port,
        }
    }
}

impl std::fmt::Display for SocketTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
            SocketTarget::Vsock { cid, port } => write!(f, "vsock://{}:{}", cid, port),
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl Listener {
    pub async fn bind(target: &SocketTarget) -> Result<Self, TransportError> {
        match target {
            SocketTarget::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(target_os = "linux")]
            SocketTarget::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                Ok(Listener::Vsock(tokio_vsock::VsockListener::bind(addr)?))
            }
            #[cfg(not(target_os = "linux"))]
            SocketTarget::Vsock { .. } => Err(TransportError::Unsupported(
                "vsock is only supported on Linux".to_string(),
            )),
        }
    }

    /// Accepts one connection; the second value describes the peer for logging
    pub async fn accept(&mut self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            #[cfg(target_os = "linux")]
            Listener::Vsock(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Stream::Vsock(stream), format!("{:?}", addr)))
            }
        }
    }

    /// Bound TCP address, if this is a TCP listener
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(target_os = "linux")]
            Listener::Vsock(_) => None,
        }
    }
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockStream),
}

impl Stream {
    pub async fn connect(target: &SocketTarget) -> Result<Self, TransportError> {
        match target {
            SocketTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(target_os = "linux")]
            SocketTarget::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                Ok(Stream::Vsock(tokio_vsock::VsockStream::connect(addr).await?))
            }
            #[cfg(not(target_os = "linux"))]
            SocketTarget::Vsock { .. } => Err(TransportError::Unsupported(
                "vsock is only supported on Linux".to_string(),
            )),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(target_os = "linux")]
            Stream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(target_os = "linux")]
            Stream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(target_os = "linux")]
            Stream::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(target_os = "linux")]
            Stream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_target_display() {
        assert_eq!(SocketTarget::tcp("enclave", 5000).to_string(), "tcp://enclave:5000");
        assert_eq!(
            SocketTarget::Vsock { cid: 16, port: 5000 }.to_string(),
            "vsock://16:5000"
        );
    }

    #[tokio::test]
    async fn test_tcp_listener_and_stream() {
        let mut listener = Listener::bind(&SocketTarget::tcp("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = Stream::connect(&SocketTarget::Tcp(addr.to_string())).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (mut stream, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
