use std::sync::Arc;

use anyhow::{anyhow, bail, Error};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tracing::debug;

use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};
use prattle_core::xmpp::error::StreamErrorCondition;
use prattle_core::xmpp::jid::Jid;
use prattle_sx::connection::{Connection, TcpConnection, TlsMode};
use prattle_sx::starttls::StarttlsNegotiator;
use prattle_sx::stream::XmppStream;

/// Everything a peer task reports back to the gateway.
#[derive(Debug)]
pub enum PeerEvent {
    /// An accepted socket being handed to its task. Registration rides the
    /// same channel as the stream events so it is always seen first.
    Accepted {
        conn: u64,
        commands: mpsc::Sender<PeerCommand>,
        ipport: String,
    },
    /// Outgoing stream is established; `stream_id` is the id the receiving
    /// server assigned (the one dialback keys hash over).
    OutOpen {
        conn: u64,
        stream_id: String,
        ssf: u32,
    },
    /// Incoming stream is established; `stream_id` is the id we assigned.
    InOpen {
        conn: u64,
        stream_id: String,
        ssf: u32,
    },
    Element {
        conn: u64,
        nad: Nad,
    },
    Closed {
        conn: u64,
    },
}

#[derive(Debug)]
pub enum PeerCommand {
    Send(Nad),
    /// One space byte to exercise the socket.
    Keepalive,
    Close,
    /// `<stream:error>` then close.
    Fail(StreamErrorCondition),
}

/// TLS material for peer connections.
#[derive(Clone)]
pub struct PeerTls {
    pub server: Option<Arc<ServerConfig>>,
    pub client: Option<Arc<ClientConfig>>,
}

pub struct PeerConfig {
    pub tls: PeerTls,
    pub require_tls: bool,
    pub max_stanza_size: Option<usize>,
}

/// Dials `ip:port` and drives the outgoing stream for `remote`.
pub async fn serve_outgoing(
    conn: u64,
    ip: String,
    port: u16,
    remote: String,
    config: PeerConfig,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
) {
    let result = outgoing_inner(conn, &ip, port, &remote, &config, &events, commands).await;
    if let Err(error) = result {
        debug!(conn, %error, "outgoing peer connection finished");
    }
    let _ = events.send(PeerEvent::Closed { conn }).await;
}

async fn outgoing_inner(
    conn: u64,
    ip: &str,
    port: u16,
    remote: &str,
    config: &PeerConfig,
    events: &mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
) -> Result<(), Error> {
    let socket = TcpStream::connect((ip, port)).await?;
    let tls = match &config.tls.client {
        Some(client) => TlsMode::Client(client.clone(), remote.to_string()),
        None => TlsMode::Disabled,
    };
    let connection = TcpConnection::new(socket, tls);
    let mut stream = XmppStream::new(connection, namespaces::XMPP_SERVER, config.max_stanza_size)
        .with_dialback();

    let remote_jid: Jid = remote
        .parse()
        .map_err(|e| anyhow!("remote domain is invalid: {e}"))?;
    stream.send_header(None, Some(&remote_jid), false).await?;
    let mut header = stream.read_header().await?;

    if header.supports_features() {
        let features = expect_features(&mut stream).await?;
        if has_feature(&features, "starttls") && stream.is_starttls_allowed() {
            StarttlsNegotiator::request(&mut stream).await?;
            stream.send_header(None, Some(&remote_jid), false).await?;
            header = stream.read_header().await?;
            if header.supports_features() {
                expect_features(&mut stream).await?;
            }
        }
    }

    if config.require_tls && !stream.is_secure() {
        let _ = stream
            .error_close(StreamErrorCondition::PolicyViolation)
            .await;
        bail!("peer stream is unencrypted and TLS is required");
    }

    let stream_id = header
        .id
        .clone()
        .ok_or_else(|| anyhow!("receiving server sent no stream id"))?;
    let _ = events
        .send(PeerEvent::OutOpen {
            conn,
            stream_id,
            ssf: stream.ssf(),
        })
        .await;

    pump(conn, stream, events, commands).await
}

/// Drives one accepted peer socket: headers, optional STARTTLS, then the
/// element loop.
pub async fn serve_incoming(
    conn: u64,
    socket: TcpStream,
    config: PeerConfig,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
) {
    let result = incoming_inner(conn, socket, &config, &events, commands).await;
    if let Err(error) = result {
        debug!(conn, %error, "incoming peer connection finished");
    }
    let _ = events.send(PeerEvent::Closed { conn }).await;
}

async fn incoming_inner(
    conn: u64,
    socket: TcpStream,
    config: &PeerConfig,
    events: &mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
) -> Result<(), Error> {
    let tls = match &config.tls.server {
        Some(server) => TlsMode::Server(server.clone()),
        None => TlsMode::Disabled,
    };
    let connection = TcpConnection::new(socket, tls);
    let mut stream = XmppStream::new(connection, namespaces::XMPP_SERVER, config.max_stanza_size)
        .with_dialback();

    loop {
        let header = stream.read_header().await?;
        stream.send_header(None, None, true).await?;

        if !header.supports_features() {
            break;
        }
        let mut features = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
        let features_root = features.root().expect("just appended");
        if stream.is_starttls_allowed() {
            let starttls = StarttlsNegotiator::advertise_feature(config.require_tls);
            features.append_nad(
                Some(features_root),
                &starttls,
                starttls.root().expect("just appended"),
            );
        }
        stream.write_nad(&features).await?;

        match stream.read_frame().await? {
            Some(Frame::Element(element)) => {
                let root = element.root().expect("parsed elements have a root");
                if element.name(root) == "starttls"
                    && element.ns_uri(root) == Some(namespaces::XMPP_STARTTLS)
                {
                    StarttlsNegotiator::negotiate_feature(&mut stream, &element).await?;
                    continue;
                }
                // dialback without further negotiation
                let _ = events
                    .send(PeerEvent::InOpen {
                        conn,
                        stream_id: stream.id().to_string(),
                        ssf: stream.ssf(),
                    })
                    .await;
                let _ = events.send(PeerEvent::Element { conn, nad: element }).await;
                return pump(conn, stream, events, commands).await;
            }
            _ => bail!("peer closed during negotiation"),
        }
    }

    let _ = events
        .send(PeerEvent::InOpen {
            conn,
            stream_id: stream.id().to_string(),
            ssf: stream.ssf(),
        })
        .await;
    pump(conn, stream, events, commands).await
}

/// The steady-state loop: peer frames out as events, gateway commands in as
/// writes.
async fn pump<C: Connection>(
    conn: u64,
    mut stream: XmppStream<C>,
    events: &mpsc::Sender<PeerEvent>,
    mut commands: mpsc::Receiver<PeerCommand>,
) -> Result<(), Error> {
    loop {
        select! {
            command = commands.recv() => {
                match command {
                    Some(PeerCommand::Send(nad)) => stream.write_nad(&nad).await?,
                    Some(PeerCommand::Keepalive) => stream.write_raw(" ").await?,
                    Some(PeerCommand::Fail(condition)) => {
                        let _ = stream.error_close(condition).await;
                        return Ok(());
                    }
                    Some(PeerCommand::Close) | None => {
                        let _ = stream.close().await;
                        return Ok(());
                    }
                }
            }
            frame = stream.read_frame() => {
                match frame {
                    Ok(Some(Frame::Element(nad))) => {
                        if events.send(PeerEvent::Element { conn, nad }).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(Some(Frame::StreamStart(_))) => {
                        bail!("unexpected stream restart from peer");
                    }
                    Ok(Some(Frame::StreamEnd)) | Ok(None) => {
                        let _ = stream.close().await;
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }
}

async fn expect_features<C: Connection>(stream: &mut XmppStream<C>) -> Result<Nad, Error> {
    match stream.read_frame().await? {
        Some(Frame::Element(element)) => {
            let root = element.root().expect("parsed elements have a root");
            if element.name(root) != "features" {
                bail!("expected stream features");
            }
            Ok(element)
        }
        _ => bail!("peer closed before sending features"),
    }
}

fn has_feature(features: &Nad, name: &str) -> bool {
    let root = features.root().expect("parsed elements have a root");
    features.children(root).any(|c| features.name(c) == name)
}
