use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use base64::prelude::*;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use prattle_core::component::bind_request;
use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};

use crate::connection::{load_client_config, TcpConnection, TlsMode};
use crate::sasl::digest_md5::DigestMd5Client;
use crate::starttls::StarttlsNegotiator;
use crate::stream::XmppStream;

const UPLINK_CHANNEL_DEPTH: usize = 64;

/// How to reach and authenticate against the router.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Component name to bind once authenticated.
    pub name: String,
    pub use_tls: bool,
    pub retry_init: u32,
    pub retry_lost: u32,
    pub retry_sleep: u64,
}

#[derive(Clone)]
pub struct UplinkHandle {
    outbound: mpsc::Sender<Nad>,
}

impl UplinkHandle {
    pub async fn send(&self, nad: Nad) -> Result<(), Error> {
        self.outbound
            .send(nad)
            .await
            .map_err(|_| anyhow!("uplink is gone"))
    }
}

/// Maintains the authenticated component stream to the router.
///
/// Packets pushed into the handle go out on the stream; every inbound
/// `<route/>` is forwarded to `inbound`. Reconnects with the configured
/// retry budget; when it is exhausted the task finishes with an error and
/// the process is expected to exit.
pub struct Uplink {
    config: UplinkConfig,
    inbound: mpsc::Sender<Nad>,
    outbound: mpsc::Receiver<Nad>,
}

impl Uplink {
    pub fn spawn(
        config: UplinkConfig,
        inbound: mpsc::Sender<Nad>,
    ) -> (UplinkHandle, JoinHandle<Result<(), Error>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(UPLINK_CHANNEL_DEPTH);
        let mut uplink = Uplink {
            config,
            inbound,
            outbound: outbound_rx,
        };
        let task = tokio::spawn(async move { uplink.run().await });
        (
            UplinkHandle {
                outbound: outbound_tx,
            },
            task,
        )
    }

    async fn run(&mut self) -> Result<(), Error> {
        let mut started = false;
        let mut attempts_left = self.config.retry_init.max(1);

        loop {
            match self.connect_and_serve().await {
                Ok(ConnectionOutcome::Shutdown) => return Ok(()),
                Ok(ConnectionOutcome::Lost) => {
                    warn!("connection to router lost");
                    started = true;
                    attempts_left = self.config.retry_lost.max(1);
                }
                Err(error) => {
                    warn!(%error, "could not reach router");
                    attempts_left = attempts_left.saturating_sub(1);
                    if attempts_left == 0 {
                        bail!(
                            "router unreachable after {} attempts",
                            if started {
                                self.config.retry_lost
                            } else {
                                self.config.retry_init
                            }
                        );
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(self.config.retry_sleep)).await;
        }
    }

    async fn connect_and_serve(&mut self) -> Result<ConnectionOutcome, Error> {
        let socket = TcpStream::connect((self.config.ip.as_str(), self.config.port)).await?;
        let tls = if self.config.use_tls {
            TlsMode::Client(load_client_config()?, self.config.ip.clone())
        } else {
            TlsMode::Disabled
        };
        let connection = TcpConnection::new(socket, tls);
        let mut stream = XmppStream::new(connection, namespaces::XMPP_COMPONENT, None);

        self.negotiate(&mut stream).await?;
        info!(name = %self.config.name, "online with router");

        loop {
            select! {
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(nad) => stream.write_nad(&nad).await?,
                        None => {
                            let _ = stream.close().await;
                            return Ok(ConnectionOutcome::Shutdown);
                        }
                    }
                }
                frame = stream.read_frame() => {
                    match frame {
                        Ok(Some(Frame::Element(nad))) => {
                            if self.inbound.send(nad).await.is_err() {
                                let _ = stream.close().await;
                                return Ok(ConnectionOutcome::Shutdown);
                            }
                        }
                        Ok(Some(Frame::StreamStart(_))) => {
                            bail!("unexpected stream restart from router");
                        }
                        Ok(Some(Frame::StreamEnd)) | Ok(None) => {
                            return Ok(ConnectionOutcome::Lost);
                        }
                        Err(_) => return Ok(ConnectionOutcome::Lost),
                    }
                }
            }
        }
    }

    async fn negotiate<C>(&self, stream: &mut XmppStream<C>) -> Result<(), Error>
    where
        C: crate::connection::Connection,
    {
        stream.send_header(None, None, false).await?;
        stream.read_header().await?;
        let features = expect_element(stream, "features").await?;

        let features = if self.config.use_tls && has_child(&features, "starttls") {
            StarttlsNegotiator::request(stream).await?;
            stream.send_header(None, None, false).await?;
            stream.read_header().await?;
            expect_element(stream, "features").await?
        } else {
            features
        };

        if !offers_digest_md5(&features) {
            bail!("router does not offer DIGEST-MD5");
        }
        self.authenticate(stream).await?;

        stream.reset();
        stream.send_header(None, None, false).await?;
        stream.read_header().await?;
        expect_element(stream, "features").await?;

        let bind = bind_request(&self.config.name);
        stream.write_nad(&bind).await?;
        let reply = expect_element(stream, "bind").await?;
        let root = reply.root().expect("parsed elements have a root");
        if let Some(error) = reply.attr_val(root, "error") {
            bail!("router refused bind: {error}");
        }
        stream.set_open();
        Ok(())
    }

    async fn authenticate<C>(&self, stream: &mut XmppStream<C>) -> Result<(), Error>
    where
        C: crate::connection::Connection,
    {
        let mut auth = Nad::with_root("auth", Some(namespaces::XMPP_SASL));
        let root = auth.root().expect("just appended");
        auth.append_attr(root, "mechanism", "DIGEST-MD5");
        stream.write_nad(&auth).await?;

        let digest_uri = format!("xmpp/{}", self.config.ip);
        let client = DigestMd5Client::new(&self.config.user, &self.config.pass, &digest_uri);
        let mut expected_rspauth = None;

        loop {
            let element = match stream.read_frame().await? {
                Some(Frame::Element(element)) => element,
                _ => bail!("stream ended during authentication"),
            };
            let root = element.root().expect("parsed elements have a root");
            match element.name(root) {
                "challenge" => {
                    let challenge = BASE64_STANDARD
                        .decode(element.text(root).trim())
                        .map_err(|e| anyhow!("bad challenge encoding: {e}"))?;
                    let challenge = String::from_utf8(challenge)
                        .map_err(|_| anyhow!("challenge is not UTF-8"))?;
                    if challenge.starts_with("rspauth=") {
                        verify_rspauth(&challenge, expected_rspauth.as_deref())?;
                        let response = Nad::with_root("response", Some(namespaces::XMPP_SASL));
                        stream.write_nad(&response).await?;
                        continue;
                    }
                    let (response, rspauth) = client
                        .respond(&challenge)
                        .map_err(|e| anyhow!("cannot answer challenge: {e}"))?;
                    expected_rspauth = Some(rspauth);
                    let mut reply = Nad::with_root("response", Some(namespaces::XMPP_SASL));
                    let reply_root = reply.root().expect("just appended");
                    reply.append_text(reply_root, &BASE64_STANDARD.encode(response));
                    stream.write_nad(&reply).await?;
                }
                "success" => {
                    let data = BASE64_STANDARD.decode(element.text(root).trim()).unwrap_or_default();
                    if let Ok(data) = String::from_utf8(data) {
                        if data.starts_with("rspauth=") {
                            verify_rspauth(&data, expected_rspauth.as_deref())?;
                        }
                    }
                    debug!("authenticated with router");
                    return Ok(());
                }
                "failure" => bail!("router rejected credentials"),
                other => bail!("unexpected {other} during authentication"),
            }
        }
    }
}

enum ConnectionOutcome {
    /// Outbound channel closed; the process is shutting down.
    Shutdown,
    /// The router went away; retry with the lost-connection budget.
    Lost,
}

fn verify_rspauth(data: &str, expected: Option<&str>) -> Result<(), Error> {
    let got = data.trim_start_matches("rspauth=");
    match expected {
        Some(expected) if expected == got => Ok(()),
        _ => bail!("router rspauth mismatch"),
    }
}

async fn expect_element<C>(stream: &mut XmppStream<C>, name: &str) -> Result<Nad, Error>
where
    C: crate::connection::Connection,
{
    match stream.read_frame().await? {
        Some(Frame::Element(element)) => {
            let root = element.root().expect("parsed elements have a root");
            if element.name(root) != name {
                bail!("expected <{name}>, got <{}>", element.name(root));
            }
            Ok(element)
        }
        _ => bail!("stream ended while waiting for <{name}>"),
    }
}

fn has_child(features: &Nad, name: &str) -> bool {
    let root = features.root().expect("parsed elements have a root");
    features.children(root).any(|c| features.name(c) == name)
}

fn offers_digest_md5(features: &Nad) -> bool {
    let root = features.root().expect("parsed elements have a root");
    let Some(mechanisms) = features.find_child(root, "mechanisms", Some(namespaces::XMPP_SASL))
    else {
        return false;
    };
    features
        .children(mechanisms)
        .any(|m| features.text(m) == "DIGEST-MD5")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_md5_offer_is_detected() {
        let mut nad = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
        let root = nad.root().unwrap();
        let mechanisms = nad.append_elem(Some(root), "mechanisms", Some(namespaces::XMPP_SASL));
        let m = nad.append_elem(Some(mechanisms), "mechanism", Some(namespaces::XMPP_SASL));
        nad.append_text(m, "DIGEST-MD5");
        assert!(offers_digest_md5(&nad));
    }

    #[test]
    fn missing_mechanisms_is_not_an_offer() {
        let nad = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
        assert!(!offers_digest_md5(&nad));
    }
}
