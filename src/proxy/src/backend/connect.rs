use crate::backend::conn::{BackendConnection, BackendOptions};
use crate::backend::ServerInfo;
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::basic;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::writers;
use crate::read_logical_packet;
use crate::session::ClientSession;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
#[cfg(feature = "tls")]
use mysql_common::constants::CapabilityFlags;
#[cfg(feature = "tls")]
use pin_project::pin_project;
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::pki_types::ServerName;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::ClientConfig;
#[cfg(feature = "tls")]
use tokio_rustls::TlsConnector;

/// The transport to a backend server: plain TCP, or TLS negotiated after
/// the SSLRequest.
#[cfg(feature = "tls")]
#[pin_project(project = BackendStreamProj)]
pub enum BackendStream {
    Plain(#[pin] TcpStream),
    Tls(#[pin] TlsStream<TcpStream>),
}

#[cfg(not(feature = "tls"))]
pub enum BackendStream {
    Plain(TcpStream),
}

#[cfg(feature = "tls")]
impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            BackendStreamProj::Plain(s) => s.poll_read(cx, buf),
            BackendStreamProj::Tls(s) => s.poll_read(cx, buf),
        }
    }
}

#[cfg(feature = "tls")]
impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            BackendStreamProj::Plain(s) => s.poll_write(cx, buf),
            BackendStreamProj::Tls(s) => s.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BackendStreamProj::Plain(s) => s.poll_flush(cx),
            BackendStreamProj::Tls(s) => s.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BackendStreamProj::Plain(s) => s.poll_shutdown(cx),
            BackendStreamProj::Tls(s) => s.poll_shutdown(cx),
        }
    }
}

#[cfg(not(feature = "tls"))]
impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let BackendStream::Plain(s) = &mut *self;
        Pin::new(s).poll_read(cx, buf)
    }
}

#[cfg(not(feature = "tls"))]
impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let BackendStream::Plain(s) = &mut *self;
        Pin::new(s).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let BackendStream::Plain(s) = &mut *self;
        Pin::new(s).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let BackendStream::Plain(s) = &mut *self;
        Pin::new(s).poll_shutdown(cx)
    }
}

/// Open a connection to `server` and drive it to ROUTING. When the server
/// wants TLS, the handshake is read in the clear, an SSLRequest goes out
/// with seq=1, the stream is wrapped, and the handshake response follows
/// with seq=2.
pub async fn connect_backend(
    server: ServerInfo,
    options: BackendOptions,
    session: &mut ClientSession,
    password: &str,
    #[cfg(feature = "tls")] tls_config: Option<Arc<ClientConfig>>,
) -> Result<BackendConnection<BackendStream>> {
    let mut stream = TcpStream::connect(&server.address).await?;

    if server.proxy_protocol {
        if let (Some(client), Ok(addr)) = (session.client_addr, server.address.parse()) {
            let line = writers::proxy_protocol_v1(client, addr);
            stream.write_all(line.as_bytes()).await?;
        }
    }

    let handshake = {
        let mut reader = PacketReader::new(&mut stream);
        let (_, pkt) = read_logical_packet!(reader);
        if pkt.is_err_packet() {
            let (_, err) = basic::err_packet(&pkt)
                .map_err(|e| ProxyError::Protocol(format!("bad ERR packet: {e:?}")))?;
            return Err(ProxyError::Auth {
                server: server.name.clone(),
                code: err.code,
                message: err.message,
                transient: false,
            });
        }
        basic::server_handshake(&pkt)
            .map_err(|e| {
                ProxyError::Protocol(format!(
                    "bad server handshake from '{}': {e:?}",
                    server.name
                ))
            })?
            .1
    };

    #[cfg(feature = "tls")]
    if server.ssl {
        let Some(tls_config) = tls_config else {
            return Err(ProxyError::Protocol(format!(
                "server '{}' requires TLS but no client TLS configuration is present",
                server.name
            )));
        };

        let capabilities = crate::backend::conn::negotiate_capabilities(
            session,
            handshake.capabilities,
            options,
            true,
        );
        {
            let mut writer = PacketWriter::new(&mut stream);
            writers::write_ssl_request(
                &mut writer,
                capabilities | CapabilityFlags::CLIENT_SSL,
                session.collation,
                session.extra_capabilities,
            )
            .await?;
        }

        let host = server
            .address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(server.address.as_str());
        let domain = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::Protocol(format!("bad TLS server name '{host}': {e}")))?;
        let tls_stream = TlsConnector::from(tls_config)
            .connect(domain, stream)
            .await?;

        let mut conn = BackendConnection::new(
            server,
            options,
            BackendStream::Tls(tls_stream),
            password.as_bytes().to_vec(),
        );
        conn.login_with_handshake(session, handshake, true).await?;
        return Ok(conn);
    }

    let mut conn = BackendConnection::new(
        server,
        options,
        BackendStream::Plain(stream),
        password.as_bytes().to_vec(),
    );
    conn.login_with_handshake(session, handshake, false).await?;
    Ok(conn)
}
