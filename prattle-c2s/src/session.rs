use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use prattle_backend::StoreHandle;
use prattle_core::component::{session_notice, wrap_route, RouteType};
use prattle_core::rate::RateLimit;
use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};
use prattle_core::xmpp::error::{StanzaErrorCondition, StreamErrorCondition};
use prattle_core::xmpp::jid::Jid;
use prattle_core::xmpp::stanza::Stanza;
use prattle_sx::connection::Connection;
use prattle_sx::sasl::SaslNegotiator;
use prattle_sx::starttls::StarttlsNegotiator;
use prattle_sx::stream::XmppStream;
use prattle_sx::uplink::UplinkHandle;

use crate::auth::C2sAuth;
use crate::register;
use crate::settings::Settings;
use crate::sm::{Delivery, SmHandle};

const DELIVERY_CHANNEL_DEPTH: usize = 64;

/// Shared plumbing a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    pub settings: Arc<Settings>,
    pub store: StoreHandle,
    pub sm: SmHandle,
    pub uplink: UplinkHandle,
}

/// One client connection, from accept to close: stream negotiation (TLS,
/// SASL, resource binding), then the relay loop against router and registry.
pub struct ClientSession;

struct Negotiated {
    jid: Jid,
    domain: String,
    realm: String,
}

impl ClientSession {
    pub async fn serve<C: Connection>(
        conn_id: u64,
        connection: C,
        ctx: SessionContext,
        shutdown: broadcast::Receiver<()>,
    ) {
        if let Err(error) = Self::inner(conn_id, connection, &ctx, shutdown).await {
            debug!(conn = conn_id, %error, "client session finished");
        }
    }

    async fn inner<C: Connection>(
        conn_id: u64,
        connection: C,
        ctx: &SessionContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let auth = C2sAuth::new(&ctx.settings, ctx.store.clone());
        let mut stream = XmppStream::new(
            connection,
            namespaces::XMPP_CLIENT,
            ctx.settings.io.max_stanza_size,
        );

        let negotiated = Self::negotiate(&mut stream, ctx, &auth).await?;
        info!(conn = conn_id, jid = %negotiated.jid, "session active");
        Self::active(&mut stream, ctx, negotiated, shutdown).await
    }

    /// Drives the stream to a bound session: headers, features, STARTTLS,
    /// SASL, resource binding, with pre-auth registration on the side.
    async fn negotiate<C: Connection>(
        stream: &mut XmppStream<C>,
        ctx: &SessionContext,
        auth: &C2sAuth,
    ) -> Result<Negotiated, Error> {
        let settings = &ctx.settings;
        let mut identity: Option<Jid> = None;
        let mut anonymous = false;

        loop {
            let header = stream.read_header().await?;
            let domain = header
                .to
                .as_ref()
                .map(|jid| jid.domain().to_string())
                .unwrap_or_default();
            if !settings.hosts_domain(&domain) {
                let local = Jid::from_domain(&settings.local.ids[0].name)
                    .map_err(|e| anyhow!("configured domain is invalid: {e}"))?;
                stream.send_header(Some(&local), None, true).await?;
                let _ = stream.error_close(StreamErrorCondition::HostUnknown).await;
                bail!("client addressed unknown host {domain}");
            }
            let realm = settings.realm_for(&domain).expect("domain is hosted");
            let local = Jid::from_domain(&domain)
                .map_err(|e| anyhow!("configured domain is invalid: {e}"))?;
            stream.send_header(Some(&local), None, true).await?;

            let tls_pending = !stream.is_secure() && stream.is_starttls_allowed();
            let tls_satisfied = stream.is_secure() || !settings.local.require_starttls;

            let mut features = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
            let features_root = features.root().expect("just appended");
            if tls_pending {
                let starttls =
                    StarttlsNegotiator::advertise_feature(settings.local.require_starttls);
                features.append_nad(
                    Some(features_root),
                    &starttls,
                    starttls.root().expect("just appended"),
                );
            }
            if identity.is_none() && tls_satisfied {
                if let Some(mechanisms) =
                    SaslNegotiator::advertise_feature(auth, stream.ssf()).await
                {
                    features.append_nad(
                        Some(features_root),
                        &mechanisms,
                        mechanisms.root().expect("just appended"),
                    );
                }
            }
            if identity.is_some() {
                let bind = Nad::with_root("bind", Some(namespaces::XMPP_BIND));
                features.append_nad(
                    Some(features_root),
                    &bind,
                    bind.root().expect("just appended"),
                );
                let session = Nad::with_root("session", Some(namespaces::XMPP_SESSION));
                features.append_nad(
                    Some(features_root),
                    &session,
                    session.root().expect("just appended"),
                );
            }
            stream.write_nad(&features).await?;

            loop {
                let frame = stream.read_frame().await?;
                let element = match frame {
                    Some(Frame::Element(element)) => element,
                    _ => bail!("client went away during negotiation"),
                };
                let root = element.root().expect("parsed elements have a root");
                match (element.name(root), element.ns_uri(root)) {
                    ("starttls", Some(namespaces::XMPP_STARTTLS)) => {
                        StarttlsNegotiator::negotiate_feature(stream, &element).await?;
                        break;
                    }
                    ("auth", Some(namespaces::XMPP_SASL)) => {
                        if settings.local.require_starttls && !stream.is_secure() {
                            let _ = stream
                                .error_close(StreamErrorCondition::PolicyViolation)
                                .await;
                            bail!("authentication before required STARTTLS");
                        }
                        anonymous = element.attr_val(root, "mechanism") == Some("ANONYMOUS");
                        if let Some(authenticated) =
                            SaslNegotiator::negotiate_feature(stream, &element, auth).await?
                        {
                            identity = Some(
                                authenticated
                                    .parse::<Jid>()
                                    .map_err(|e| anyhow!("authenticated identity is invalid: {e}"))?,
                            );
                            stream.reset();
                            break;
                        }
                    }
                    ("iq", _) => {
                        if let Some(identity) = identity.clone() {
                            if let Some(jid) = Self::try_bind(
                                stream, ctx, &element, &identity, anonymous, &realm,
                            )
                            .await?
                            {
                                return Ok(Negotiated { jid, domain, realm });
                            }
                        } else if settings.authreg.register_enable
                            && register::is_register_iq(&element)
                        {
                            register::handle_preauth(stream, &element, &ctx.store, &realm)
                                .await?;
                        } else {
                            let _ = stream
                                .error_close(StreamErrorCondition::NotAuthorized)
                                .await;
                            bail!("iq before authentication");
                        }
                    }
                    _ => {
                        let _ = stream
                            .error_close(StreamErrorCondition::NotAuthorized)
                            .await;
                        bail!("stanza before session establishment");
                    }
                }
            }
        }
    }

    /// Resource binding. Replies on the stream; returns the bound JID once
    /// the client has one.
    async fn try_bind<C: Connection>(
        stream: &mut XmppStream<C>,
        ctx: &SessionContext,
        element: &Nad,
        identity: &Jid,
        anonymous: bool,
        realm: &str,
    ) -> Result<Option<Jid>, Error> {
        let root = element.root().expect("parsed elements have a root");
        let Some(bind) = element.find_child(root, "bind", Some(namespaces::XMPP_BIND)) else {
            // not a bind request; nothing else is valid before the session
            Self::stanza_error(stream, element, StanzaErrorCondition::ServiceUnavailable).await?;
            return Ok(None);
        };
        if element.attr_val(root, "type") != Some("set") {
            Self::stanza_error(stream, element, StanzaErrorCondition::BadRequest).await?;
            return Ok(None);
        }

        if !anonymous {
            let node = identity.node().unwrap_or_default();
            if !ctx.store.user_exists(node, realm).await.unwrap_or(false) {
                Self::stanza_error(stream, element, StanzaErrorCondition::Forbidden).await?;
                return Ok(None);
            }
        }

        let resource = element
            .find_child(bind, "resource", Some(namespaces::XMPP_BIND))
            .map(|c| element.text(c))
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let jid = match identity.bind(&resource) {
            Ok(jid) => jid,
            Err(_) => {
                Self::stanza_error(stream, element, StanzaErrorCondition::BadRequest).await?;
                return Ok(None);
            }
        };

        let id = element.attr_val(root, "id").unwrap_or("").to_string();
        let mut reply = Nad::with_root("iq", Some(namespaces::XMPP_CLIENT));
        let reply_root = reply.root().expect("just appended");
        if !id.is_empty() {
            reply.append_attr(reply_root, "id", &id);
        }
        reply.append_attr(reply_root, "type", "result");
        let bind_reply = reply.append_elem(Some(reply_root), "bind", Some(namespaces::XMPP_BIND));
        let jid_elem = reply.append_elem(Some(bind_reply), "jid", Some(namespaces::XMPP_BIND));
        reply.append_text(jid_elem, &jid.to_string());
        stream.write_nad(&reply).await?;

        Ok(Some(jid))
    }

    async fn active<C: Connection>(
        stream: &mut XmppStream<C>,
        ctx: &SessionContext,
        negotiated: Negotiated,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let Negotiated { jid, domain, realm } = negotiated;
        let settings = &ctx.settings;
        stream.set_open();

        let (tx, mut rx) = mpsc::channel(DELIVERY_CHANNEL_DEPTH);
        ctx.sm.started(jid.clone(), tx).await;
        let _ = ctx
            .uplink
            .send(session_notice(
                &settings.sm,
                &settings.id,
                &jid.to_string(),
                "started",
            ))
            .await;

        let mut rate = RateLimit::new(
            settings.io.limits.bytes,
            settings.io.limits.seconds,
            settings.io.limits.throttle,
        );
        let mut last_activity = Instant::now();
        let mut reaper = tokio::time::interval(Duration::from_secs(
            settings.io.check.interval.max(1),
        ));
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut closing = false;

        let result: Result<(), Error> = loop {
            select! {
                frame = stream.read_frame() => {
                    match frame {
                        Ok(Some(Frame::Element(element))) => {
                            last_activity = Instant::now();
                            if let Err(e) = Self::handle_client_element(
                                stream, ctx, &jid, &domain, &realm, &mut rate, element,
                            )
                            .await
                            {
                                break Err(e);
                            }
                        }
                        Ok(Some(Frame::StreamStart(_))) => {
                            break Err(anyhow!("unexpected stream restart"));
                        }
                        Ok(Some(Frame::StreamEnd)) | Ok(None) => {
                            if !closing {
                                let _ = stream.close().await;
                            }
                            break Ok(());
                        }
                        Err(error) => break Err(error),
                    }
                }
                delivery = rx.recv() => {
                    match delivery {
                        Some(Delivery::Stanza(nad)) => {
                            if let Err(e) = stream.write_nad(&nad).await {
                                break Err(e);
                            }
                        }
                        Some(Delivery::Replaced) => {
                            let _ = stream.error_close(StreamErrorCondition::Conflict).await;
                            break Ok(());
                        }
                        None => break Ok(()),
                    }
                }
                _ = reaper.tick() => {
                    let quiet = last_activity.elapsed().as_secs();
                    if settings.io.check.idle > 0 && quiet > settings.io.check.idle {
                        let _ = stream.error_close(StreamErrorCondition::HostGone).await;
                        break Ok(());
                    }
                    if settings.io.check.keepalive > 0 && quiet > settings.io.check.keepalive {
                        // a single space exercises the socket without
                        // disturbing the XML stream
                        if let Err(e) = stream.write_raw(" ").await {
                            break Err(e);
                        }
                    }
                }
                _ = shutdown.recv(), if !closing => {
                    let _ = stream.error_close(StreamErrorCondition::SystemShutdown).await;
                    closing = true;
                }
            }
        };

        ctx.sm.ended(jid.clone()).await;
        let _ = ctx
            .uplink
            .send(session_notice(
                &settings.sm,
                &settings.id,
                &jid.to_string(),
                "ended",
            ))
            .await;
        result
    }

    async fn handle_client_element<C: Connection>(
        stream: &mut XmppStream<C>,
        ctx: &SessionContext,
        jid: &Jid,
        domain: &str,
        realm: &str,
        rate: &mut RateLimit,
        mut element: Nad,
    ) -> Result<(), Error> {
        let root = element.root().expect("parsed elements have a root");

        // session establishment is a local no-op kept for RFC 3921 clients
        if element.name(root) == "iq"
            && element
                .find_child(root, "session", Some(namespaces::XMPP_SESSION))
                .is_some()
        {
            let id = element.attr_val(root, "id").unwrap_or("").to_string();
            let mut reply = Nad::with_root("iq", Some(namespaces::XMPP_CLIENT));
            let reply_root = reply.root().expect("just appended");
            if !id.is_empty() {
                reply.append_attr(reply_root, "id", &id);
            }
            reply.append_attr(reply_root, "type", "result");
            stream.write_nad(&reply).await?;
            return Ok(());
        }

        // registration traffic addressed to the local domain stays local
        let local_to = match element.attr_val(root, "to") {
            None => true,
            Some(to) => to == domain,
        };
        if register::is_register_iq(&element) && local_to {
            if !ctx.settings.authreg.register_enable {
                Self::stanza_error(stream, &element, StanzaErrorCondition::ServiceUnavailable)
                    .await?;
                return Ok(());
            }
            let close = register::handle_session(stream, &element, &ctx.store, realm, jid).await?;
            if close {
                let _ = stream.close().await;
                bail!("account removed");
            }
            return Ok(());
        }

        // everything else goes to the session manager, stamped with the
        // session's full JID
        element.set_attr(root, "from", &jid.to_string());
        let wire_len = element.serialize().len() as u64;
        let route = wrap_route(
            domain,
            &ctx.settings.id,
            RouteType::Unicast,
            Some((&element, root)),
        );
        if !rate.add(wire_len) {
            if let Some(pause) = rate.throttle_remaining() {
                debug!(jid = %jid, "session over byte budget, pausing reads");
                tokio::time::sleep(pause).await;
            }
        }
        let _ = ctx.uplink.send(route).await;
        Ok(())
    }

    async fn stanza_error<C: Connection>(
        stream: &mut XmppStream<C>,
        element: &Nad,
        condition: StanzaErrorCondition,
    ) -> Result<(), Error> {
        if let Some(reply) = Stanza::new(element.clone()).error_reply(condition) {
            stream.write_nad(&reply.nad).await?;
        }
        Ok(())
    }
}
