//! Socket and in-band TLS upgrade.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    Result,
    connection::{SslMode, TlsOptions},
};

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

/// an either `TcpStream`, `UnixStream` or tls wrapped `TcpStream`, which implement
/// `AsyncRead` and `AsyncWrite` transparently
pub struct Socket {
    kind: Kind,
}

enum Kind {
    TokioTcp(tokio::net::TcpStream),
    #[cfg(unix)]
    TokioUnixSocket(tokio::net::UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>),
}

impl Socket {
    pub async fn connect(target: &Target) -> io::Result<Socket> {
        match target {
            Target::Tcp { host, port } => Self::connect_tcp(host, *port).await,
            #[cfg(unix)]
            Target::Unix(path) => Self::connect_socket(path).await,
        }
    }

    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        let socket = tokio::net::TcpStream::connect((host,port)).await?;
        socket.set_nodelay(true)?;
        Ok(Socket { kind: Kind::TokioTcp(socket) })
    }

    #[cfg(unix)]
    pub async fn connect_socket(path: &std::path::Path) -> io::Result<Socket> {
        let socket = tokio::net::UnixStream::connect(path).await?;
        Ok(Socket { kind: Kind::TokioUnixSocket(socket) })
    }

    /// Returns `true` if traffic is encrypted.
    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Kind::Tls(_) = self.kind {
            return true;
        }
        false
    }

    /// Perform `SSLRequest` negotiation, upgrading to TLS when the server agrees.
    ///
    /// Unix sockets are never upgraded.
    pub async fn negotiate_tls(self, opts: &TlsOptions, host: &str) -> Result<Socket> {
        if opts.mode == SslMode::Disable {
            return Ok(self);
        }

        let tcp = match self.kind {
            Kind::TokioTcp(tcp) => tcp,
            kind => return Ok(Socket { kind }),
        };

        #[cfg(feature = "tls")]
        if let Some(config) = opts.config.clone() {
            return Self::upgrade(tcp, config, opts.mode, host).await;
        }

        let _ = host;
        Self::without_tls(Socket { kind: Kind::TokioTcp(tcp) }, opts.mode)
    }

    #[cfg(feature = "tls")]
    async fn upgrade(
        mut tcp: tokio::net::TcpStream,
        config: std::sync::Arc<rustls::ClientConfig>,
        mode: SslMode,
        host: &str,
    ) -> Result<Socket> {
        use bytes::BytesMut;
        use rustls::pki_types::ServerName;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use crate::{Error, common::verbose, postgres::{ProtocolError, frontend::SslRequest}};

        let mut buf = BytesMut::with_capacity(8);
        SslRequest.write(&mut buf);
        tcp.write_all(&buf).await?;
        tcp.flush().await?;

        match tcp.read_u8().await? {
            b'S' => {
                verbose!("tls accepted by server");
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|_| Error::config("invalid tls server name"))?;
                let tls = tokio_rustls::TlsConnector::from(config).connect(name, tcp).await?;
                Ok(Socket { kind: Kind::Tls(Box::new(tls)) })
            },
            b'N' => {
                verbose!("tls refused by server");
                Self::without_tls(Socket { kind: Kind::TokioTcp(tcp) }, mode)
            },
            found => Err(ProtocolError::SslResponse { found }.into()),
        }
    }

    fn without_tls(socket: Socket, mode: SslMode) -> Result<Socket> {
        match mode {
            SslMode::Require => Err(crate::Error::config("tls required but not available")),
            SslMode::Disable | SslMode::Prefer => Ok(socket),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_flush(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::TokioTcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::TokioUnixSocket(u) => Pin::new(u).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Kind::TokioTcp(ref tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::TokioUnixSocket(ref unix) => std::fmt::Debug::fmt(&unix, f),
            #[cfg(feature = "tls")]
            Kind::Tls(_) => f.write_str("TlsStream"),
        }
    }
}
