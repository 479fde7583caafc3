use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail, Error};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use tokio_rustls::{Accept, Connect, TlsAcceptor, TlsConnector};

/// A socket a stream can run over. `upgrade` wraps it in TLS in place; the
/// stream machinery re-splits afterwards, which is how STARTTLS keeps the
/// connection while swapping the transport.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Sized + Send {
    type Upgrade: Future<Output = Result<Self, Error>> + Send;

    fn upgrade(self) -> Result<Self::Upgrade, Error>;
    fn is_starttls_allowed(&self) -> bool;

    /// Negotiated security strength factor; 0 means plaintext.
    fn ssf(&self) -> u32;
}

/// TLS material and role for a [`TcpConnection`].
#[derive(Clone)]
pub enum TlsMode {
    /// No certificate material; STARTTLS is not offered.
    Disabled,
    /// Server role: accept handshakes with our certificate.
    Server(Arc<ServerConfig>),
    /// Client role: initiate handshakes, verifying `server_name`.
    Client(Arc<ClientConfig>, String),
}

enum Socket {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

pub struct TcpConnection {
    socket: Socket,
    tls: TlsMode,
}

impl TcpConnection {
    pub fn new(socket: TcpStream, tls: TlsMode) -> Self {
        Self {
            socket: Socket::Plain(socket),
            tls,
        }
    }

    /// Accept-side socket that is TLS from the first byte (wrapper port).
    pub async fn accept_tls(socket: TcpStream, config: Arc<ServerConfig>) -> Result<Self, Error> {
        let stream = TlsAcceptor::from(config).accept(socket).await?;
        Ok(Self {
            socket: Socket::ServerTls(Box::new(stream)),
            tls: TlsMode::Disabled,
        })
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let Socket::Plain(socket) = self.socket else {
            bail!("connection is already encrypted");
        };
        match self.tls {
            TlsMode::Server(config) => Ok(TcpConnectionUpgrade::Accept(
                TlsAcceptor::from(config).accept(socket),
            )),
            TlsMode::Client(config, server_name) => {
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|_| anyhow!("invalid TLS server name {server_name}"))?;
                Ok(TcpConnectionUpgrade::Connect(
                    TlsConnector::from(config).connect(name, socket),
                ))
            }
            TlsMode::Disabled => bail!("no TLS material configured"),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        matches!(self.socket, Socket::Plain(_)) && !matches!(self.tls, TlsMode::Disabled)
    }

    fn ssf(&self) -> u32 {
        match &self.socket {
            Socket::Plain(_) => 0,
            Socket::ServerTls(stream) => suite_ssf(stream.get_ref().1.negotiated_cipher_suite()),
            Socket::ClientTls(stream) => suite_ssf(stream.get_ref().1.negotiated_cipher_suite()),
        }
    }
}

fn suite_ssf(suite: Option<SupportedCipherSuite>) -> u32 {
    let Some(suite) = suite else { return 0 };
    let name = format!("{:?}", suite.suite());
    if name.contains("256") {
        256
    } else {
        128
    }
}

pub enum TcpConnectionUpgrade {
    Accept(Accept<TcpStream>),
    Connect(Connect<TcpStream>),
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let socket = match self.get_mut() {
            TcpConnectionUpgrade::Accept(accept) => {
                let stream = ready!(Pin::new(accept).poll(cx))?;
                Socket::ServerTls(Box::new(stream))
            }
            TcpConnectionUpgrade::Connect(connect) => {
                let stream = ready!(Pin::new(connect).poll(cx))?;
                Socket::ClientTls(Box::new(stream))
            }
        };
        Poll::Ready(Ok(TcpConnection {
            socket,
            tls: TlsMode::Disabled,
        }))
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Loads a PEM file holding the certificate chain followed by a PKCS#8 key.
/// Failure here is reported to the caller, which logs it and carries on with
/// TLS disabled.
pub fn load_server_config(pemfile: &str) -> Result<Arc<ServerConfig>, Error> {
    let certs = {
        let mut reader = BufReader::new(File::open(pemfile)?);
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<CertificateDer<'static>>, _>>()?
    };
    let key = {
        let mut reader = BufReader::new(File::open(pemfile)?);
        let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .next()
            .ok_or_else(|| anyhow!("no private key in {pemfile}"))??;
        key
    };
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))?;
    Ok(Arc::new(config))
}

/// Client config trusting the platform roots.
pub fn load_client_config() -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()? {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// In-memory pipe used by tests; it cannot be upgraded.
impl Connection for tokio::io::DuplexStream {
    type Upgrade = std::future::Ready<Result<Self, Error>>;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        bail!("in-memory streams cannot negotiate TLS")
    }

    fn is_starttls_allowed(&self) -> bool {
        false
    }

    fn ssf(&self) -> u32 {
        0
    }
}
