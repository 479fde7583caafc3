use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Error};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use prattle_core::rate::RateLimit;
use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};
use prattle_core::xmpp::error::StreamErrorCondition;
use prattle_core::xmpp::jid::Jid;
use prattle_sx::connection::Connection;
use prattle_sx::sasl::{AuthRequest, AuthResponse, Mechanism, SaslCallback, SaslNegotiator};
use prattle_sx::starttls::StarttlsNegotiator;
use prattle_sx::stream::XmppStream;

use crate::settings::Settings;
use crate::table::{BindError, TableHandle};

const DELIVERY_CHANNEL_DEPTH: usize = 64;

/// SASL mediation for component streams: the preconfigured user/secret
/// table, DIGEST-MD5 only.
pub struct RouterAuth {
    users: HashMap<String, String>,
    realm: String,
}

impl RouterAuth {
    pub fn new(settings: &Settings) -> Self {
        Self {
            users: settings.users.clone(),
            realm: settings.realm().to_string(),
        }
    }
}

impl SaslCallback for RouterAuth {
    async fn handle(&self, request: AuthRequest) -> AuthResponse {
        match request {
            AuthRequest::CheckMechanism { mechanism, .. } => match mechanism {
                Mechanism::DigestMd5 => AuthResponse::Ok,
                _ => AuthResponse::Fail,
            },
            AuthRequest::Realm { .. } => AuthResponse::Realm(self.realm.clone()),
            AuthRequest::Password { user, .. } => {
                AuthResponse::Password(self.users.get(&user).cloned())
            }
            AuthRequest::CheckPassword {
                user, candidate, ..
            } => match self.users.get(&user) {
                Some(secret) if secret == &candidate => AuthResponse::Ok,
                _ => AuthResponse::Fail,
            },
            AuthRequest::CheckAuthzid { .. } => AuthResponse::Fail,
            AuthRequest::GenAuthzid => AuthResponse::Fail,
        }
    }
}

/// One accepted component connection: negotiation, bind protocol, and the
/// forwarding loop against the routing table.
pub struct ComponentSession;

impl ComponentSession {
    pub async fn serve<C: Connection>(
        conn_id: u64,
        connection: C,
        settings: Arc<Settings>,
        table: TableHandle,
        shutdown: broadcast::Receiver<()>,
    ) {
        if let Err(error) = Self::inner(conn_id, connection, &settings, &table, shutdown).await {
            debug!(conn = conn_id, %error, "component stream finished");
        }
        table.detach(conn_id).await;
    }

    async fn inner<C: Connection>(
        conn_id: u64,
        connection: C,
        settings: &Settings,
        table: &TableHandle,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let router_jid = Jid::from_domain(&settings.id)
            .map_err(|e| anyhow!("router id is not a valid domain: {e}"))?;
        let auth = RouterAuth::new(settings);
        let mut stream = XmppStream::new(
            connection,
            namespaces::XMPP_COMPONENT,
            settings.io.max_stanza_size,
        );

        let identity = Self::negotiate(&mut stream, &router_jid, &auth).await?;
        let user = identity
            .parse::<Jid>()
            .ok()
            .and_then(|jid| jid.node().map(str::to_string))
            .unwrap_or(identity);
        info!(conn = conn_id, user = %user, "component authenticated");

        // post-auth restart: the peer resends its header, we answer with an
        // empty feature set, then binds and routes flow
        stream.read_header().await?;
        stream.send_header(Some(&router_jid), None, true).await?;
        let features = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
        stream.write_nad(&features).await?;
        stream.set_open();

        let (tx, mut rx) = mpsc::channel(DELIVERY_CHANNEL_DEPTH);
        table.attach(conn_id, &user, tx).await;

        let mut rate = RateLimit::new(
            settings.io.limits.bytes,
            settings.io.limits.seconds,
            settings.io.limits.throttle,
        );
        let mut closing = false;

        loop {
            select! {
                delivery = rx.recv() => {
                    match delivery {
                        Some(nad) => stream.write_nad(&nad).await?,
                        None => break,
                    }
                }
                frame = stream.read_frame() => {
                    match frame {
                        Ok(Some(Frame::Element(element))) => {
                            Self::handle_element(
                                conn_id, &mut stream, table, &mut rate, element,
                            )
                            .await?;
                        }
                        Ok(Some(Frame::StreamStart(_))) => {
                            bail!("unexpected stream restart");
                        }
                        Ok(Some(Frame::StreamEnd)) | Ok(None) => {
                            if !closing {
                                let _ = stream.close().await;
                            }
                            break;
                        }
                        Err(error) => return Err(error),
                    }
                }
                _ = shutdown.recv(), if !closing => {
                    // announce shutdown and keep draining until the peer
                    // closes its half
                    let _ = stream.close().await;
                    closing = true;
                }
            }
        }
        Ok(())
    }

    /// Pre-auth negotiation: header exchange, features, STARTTLS and SASL
    /// rounds until an identity is established.
    async fn negotiate<C: Connection>(
        stream: &mut XmppStream<C>,
        router_jid: &Jid,
        auth: &RouterAuth,
    ) -> Result<String, Error> {
        loop {
            stream.read_header().await?;
            stream.send_header(Some(router_jid), None, true).await?;

            let mut features = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
            let features_root = features.root().expect("just appended");
            if stream.is_starttls_allowed() {
                let starttls = StarttlsNegotiator::advertise_feature(false);
                features.append_nad(
                    Some(features_root),
                    &starttls,
                    starttls.root().expect("just appended"),
                );
            }
            if let Some(mechanisms) = SaslNegotiator::advertise_feature(auth, stream.ssf()).await {
                features.append_nad(
                    Some(features_root),
                    &mechanisms,
                    mechanisms.root().expect("just appended"),
                );
            }
            stream.write_nad(&features).await?;

            loop {
                let frame = stream.read_frame().await?;
                let element = match frame {
                    Some(Frame::Element(element)) => element,
                    _ => bail!("peer closed during negotiation"),
                };
                let root = element.root().expect("parsed elements have a root");
                match (element.name(root), element.ns_uri(root)) {
                    ("starttls", Some(namespaces::XMPP_STARTTLS)) => {
                        StarttlsNegotiator::negotiate_feature(stream, &element).await?;
                        break; // stream reset, restart negotiation
                    }
                    ("auth", Some(namespaces::XMPP_SASL)) => {
                        if let Some(identity) =
                            SaslNegotiator::negotiate_feature(stream, &element, auth).await?
                        {
                            stream.reset();
                            return Ok(identity);
                        }
                        // failure reported, the peer may try again
                    }
                    _ => {
                        let _ = stream
                            .error_close(StreamErrorCondition::NotAuthorized)
                            .await;
                        bail!("element before authentication");
                    }
                }
            }
        }
    }

    async fn handle_element<C: Connection>(
        conn_id: u64,
        stream: &mut XmppStream<C>,
        table: &TableHandle,
        rate: &mut RateLimit,
        element: Nad,
    ) -> Result<(), Error> {
        let root = element.root().expect("parsed elements have a root");
        let name = element.name(root).to_string();
        let ns = element.ns_uri(root).map(str::to_string);
        match (name.as_str(), ns.as_deref()) {
            ("bind", Some(namespaces::XMPP_COMPONENT)) => {
                let Some(name) = element.attr_val(root, "name").map(str::to_string) else {
                    Self::bind_reply(stream, "", Some(BindError::InvalidName)).await?;
                    return Ok(());
                };
                let log_sink = matches!(element.attr_val(root, "log"), Some("1") | Some("true"));
                match table.bind(conn_id, &name, log_sink).await {
                    Ok(bound) => Self::bind_reply(stream, &bound, None).await?,
                    Err(error) => {
                        Self::bind_reply(stream, &name, Some(error)).await?;
                        if error == BindError::NotAuthorized {
                            let _ = stream
                                .error_close(StreamErrorCondition::NotAuthorized)
                                .await;
                            bail!("unauthorized bind for {name}");
                        }
                    }
                }
            }
            ("unbind", Some(namespaces::XMPP_COMPONENT)) => {
                if let Some(name) = element.attr_val(root, "name").map(str::to_string) {
                    table.unbind(conn_id, &name).await;
                    let mut reply = Nad::with_root("unbind", Some(namespaces::XMPP_COMPONENT));
                    let reply_root = reply.root().expect("just appended");
                    reply.append_attr(reply_root, "name", &name);
                    stream.write_nad(&reply).await?;
                }
            }
            ("route", Some(namespaces::XMPP_COMPONENT)) => {
                let wire_len = element.serialize().len() as u64;
                if !rate.add(wire_len) {
                    if let Some(pause) = rate.throttle_remaining() {
                        warn!(conn = conn_id, "component over byte budget, pausing reads");
                        tokio::time::sleep(pause).await;
                    }
                }
                table.route(conn_id, element).await;
            }
            _ => debug!(conn = conn_id, "ignoring unknown component element"),
        }
        Ok(())
    }

    async fn bind_reply<C: Connection>(
        stream: &mut XmppStream<C>,
        name: &str,
        error: Option<BindError>,
    ) -> Result<(), Error> {
        let mut reply = Nad::with_root("bind", Some(namespaces::XMPP_COMPONENT));
        let root = reply.root().expect("just appended");
        if !name.is_empty() {
            reply.append_attr(root, "name", name);
        }
        if let Some(error) = error {
            reply.append_attr(root, "error", error.as_str());
        }
        stream.write_nad(&reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> RouterAuth {
        RouterAuth {
            users: HashMap::from([("c2s-user".to_string(), "c2s-secret".to_string())]),
            realm: "router.example.net".to_string(),
        }
    }

    #[tokio::test]
    async fn only_digest_md5_is_offered() {
        let auth = auth();
        let ok = auth
            .handle(AuthRequest::CheckMechanism {
                mechanism: Mechanism::DigestMd5,
                ssf: 0,
            })
            .await;
        assert!(matches!(ok, AuthResponse::Ok));
        let plain = auth
            .handle(AuthRequest::CheckMechanism {
                mechanism: Mechanism::Plain,
                ssf: 256,
            })
            .await;
        assert!(matches!(plain, AuthResponse::Fail));
    }

    #[tokio::test]
    async fn check_password_accepts_a_match() {
        // matching secret answers Ok, anything else Fail
        let auth = auth();
        let good = auth
            .handle(AuthRequest::CheckPassword {
                user: "c2s-user".to_string(),
                realm: "router.example.net".to_string(),
                candidate: "c2s-secret".to_string(),
            })
            .await;
        assert!(matches!(good, AuthResponse::Ok));

        let bad = auth
            .handle(AuthRequest::CheckPassword {
                user: "c2s-user".to_string(),
                realm: "router.example.net".to_string(),
                candidate: "wrong".to_string(),
            })
            .await;
        assert!(matches!(bad, AuthResponse::Fail));
    }

    #[tokio::test]
    async fn stored_secret_is_revealed_for_digest() {
        let auth = auth();
        let response = auth
            .handle(AuthRequest::Password {
                user: "c2s-user".to_string(),
                realm: "router.example.net".to_string(),
            })
            .await;
        match response {
            AuthResponse::Password(Some(secret)) => assert_eq!(secret, "c2s-secret"),
            other => panic!("expected password, got {:?}", other),
        }
    }
}
