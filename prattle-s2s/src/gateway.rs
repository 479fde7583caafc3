use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use prattle_core::component::{wrap_route, RouteType, RouteView};
use prattle_core::xml::{namespaces, Nad};
use prattle_core::xmpp::error::{StanzaErrorCondition, StreamErrorCondition};
use prattle_core::xmpp::jid::Jid;
use prattle_core::xmpp::stanza::Stanza;

use crate::dialback::{self, db_key, route_key};
use crate::dns::{self, DnsCache};
use crate::peer::{self, PeerCommand, PeerConfig, PeerEvent, PeerTls};
use crate::settings::Settings;
use crate::whitelist::Whitelist;

const EVENT_CHANNEL_DEPTH: usize = 64;

/// Dialback progress of one directional domain pair on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    None,
    InProgress,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

struct Conn {
    dir: Direction,
    commands: mpsc::Sender<PeerCommand>,
    ipport: String,
    /// Outgoing conns serve one remote domain.
    remote: Option<String>,
    /// Outgoing: assigned by the receiving server. Incoming: assigned by us.
    stream_id: Option<String>,
    ssf: u32,
    online: bool,
    routes: HashMap<String, RouteState>,
    states_time: HashMap<String, Instant>,
    init_time: Instant,
    last_activity: Instant,
    last_packet: Instant,
    verify: u32,
    last_verify: Instant,
}

impl Conn {
    fn new(dir: Direction, commands: mpsc::Sender<PeerCommand>, ipport: String) -> Self {
        let now = Instant::now();
        Self {
            dir,
            commands,
            ipport,
            remote: None,
            stream_id: None,
            ssf: 0,
            online: false,
            routes: HashMap::new(),
            states_time: HashMap::new(),
            init_time: now,
            last_activity: now,
            last_packet: now,
            verify: 0,
            last_verify: now,
        }
    }

    fn set_state(&mut self, key: &str, state: RouteState) {
        self.routes.insert(key.to_string(), state);
        self.states_time.insert(key.to_string(), Instant::now());
    }
}

pub enum GatewayEvent {
    /// A `<route/>` envelope from the router.
    Packet(Nad),
    Shutdown,
}

/// The connection manager: outgoing and incoming peer connections, per-route
/// dialback state machines, outbound queues, the DNS cache and the reapers.
/// Single task; peers and the router talk to it through channels.
pub struct Gateway {
    events: mpsc::Receiver<GatewayEvent>,
    peer_events: mpsc::Receiver<PeerEvent>,
    peer_events_tx: mpsc::Sender<PeerEvent>,
    router: mpsc::Sender<Nad>,
    settings: Arc<Settings>,
    secret: String,
    whitelist: Whitelist,
    tls: PeerTls,
    conn_ids: Arc<AtomicU64>,
    conns: HashMap<u64, Conn>,
    out_by_ipport: HashMap<String, u64>,
    /// Stanzas (client namespace) parked per remote domain.
    outq: HashMap<String, VecDeque<Nad>>,
    /// Verify requests parked until an authoritative connection is online.
    verifyq: HashMap<String, Vec<Nad>>,
    /// Verify id (incoming stream id) to the incoming conn awaiting the
    /// answer.
    pending_verify: HashMap<String, u64>,
    dnscache: DnsCache,
}

impl Gateway {
    async fn run(&mut self) {
        let mut reaper = tokio::time::interval(Duration::from_secs(
            self.settings.check.interval.max(1),
        ));
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                event = self.events.recv() => {
                    match event {
                        Some(GatewayEvent::Packet(nad)) => self.handle_packet(nad).await,
                        Some(GatewayEvent::Shutdown) | None => {
                            for conn in self.conns.values() {
                                let _ = conn.commands.send(PeerCommand::Close).await;
                            }
                            return;
                        }
                    }
                }
                Some(event) = self.peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }
                _ = reaper.tick() => {
                    self.reap().await;
                }
            }
        }
    }

    async fn handle_packet(&mut self, nad: Nad) {
        let Some(view) = RouteView::parse(&nad) else {
            debug!("non-route element from router, dropping");
            return;
        };
        let Some(payload) = view.payload else { return };

        let mut stanza = Nad::new();
        stanza.append_nad(None, &nad, payload);
        let root = stanza.root().expect("just appended");

        if stanza.ns_uri(root) == Some(dns::NS_RESOLVER) {
            self.handle_resolver_answer(&stanza).await;
            return;
        }

        let parsed = Stanza::new(stanza.clone());
        let (Some(to), Some(from)) = (parsed.to(), parsed.from()) else {
            debug!("outbound stanza without addressing, dropping");
            return;
        };
        let remote = to.domain().to_string();
        let local = from.domain().to_string();

        if !self.whitelist.permits(&remote) {
            info!(%remote, "destination not whitelisted, bouncing");
            self.bounce_stanza(&stanza, StanzaErrorCondition::Forbidden)
                .await;
            return;
        }

        // a validated route delivers immediately
        let key = route_key(&local, &remote);
        if let Some(&conn) = self
            .out_by_ipport
            .values()
            .find(|&&c| {
                self.conns
                    .get(&c)
                    .map(|conn| conn.routes.get(&key) == Some(&RouteState::Valid) && conn.online)
                    .unwrap_or(false)
            })
        {
            self.send_stanza(conn, &stanza).await;
            return;
        }

        self.outq.entry(remote.clone()).or_default().push_back(stanza);
        self.ensure_route(&local, &remote).await;
    }

    /// Drives an outgoing pair towards `Valid`: resolve, connect, dialback.
    async fn ensure_route(&mut self, local: &str, remote: &str) {
        let Some(entry) = self.dnscache.lookup(remote) else {
            if self.dnscache.mark_pending(remote) {
                let request = dns::resolve_request(remote);
                let request_root = request.root().expect("just appended");
                let route = wrap_route(
                    &self.settings.local.resolver,
                    &self.settings.id,
                    RouteType::Unicast,
                    Some((&request, request_root)),
                );
                let _ = self.router.send(route).await;
            }
            return;
        };

        let key = route_key(local, remote);
        let ipport = entry.ipport();
        match self.out_by_ipport.get(&ipport).copied() {
            Some(conn_id) => {
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                match conn.routes.get(&key).copied() {
                    None | Some(RouteState::None) if conn.online => {
                        self.start_dialback(conn_id, local, remote).await;
                    }
                    None => {
                        conn.set_state(&key, RouteState::None);
                    }
                    _ => {}
                }
            }
            None => {
                let conn_id = self.open_outgoing(remote, &entry.ip, entry.port, &ipport);
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.set_state(&key, RouteState::None);
                }
            }
        }
    }

    fn open_outgoing(&mut self, remote: &str, ip: &str, port: u16, ipport: &str) -> u64 {
        let conn_id = self.conn_ids.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let mut conn = Conn::new(Direction::Outgoing, commands_tx, ipport.to_string());
        conn.remote = Some(remote.to_string());
        self.conns.insert(conn_id, conn);
        self.out_by_ipport.insert(ipport.to_string(), conn_id);

        info!(conn = conn_id, %remote, %ipport, "opening peer connection");
        let config = PeerConfig {
            tls: self.tls.clone(),
            require_tls: self.settings.security.require_tls,
            max_stanza_size: self.settings.io.max_stanza_size,
        };
        tokio::spawn(peer::serve_outgoing(
            conn_id,
            ip.to_string(),
            port,
            remote.to_string(),
            config,
            self.peer_events_tx.clone(),
            commands_rx,
        ));
        conn_id
    }

    async fn start_dialback(&mut self, conn_id: u64, local: &str, remote: &str) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let Some(stream_id) = conn.stream_id.clone() else {
            return;
        };
        let key = db_key(&self.secret, remote, &stream_id);
        let request = dialback::result_request(local, remote, &key);
        conn.set_state(&route_key(local, remote), RouteState::InProgress);
        let _ = conn.commands.send(PeerCommand::Send(request)).await;
        debug!(conn = conn_id, %local, %remote, "dialback started");
    }

    async fn handle_resolver_answer(&mut self, stanza: &Nad) {
        match dns::parse_resolved(stanza) {
            Some(Ok(resolved)) => {
                self.dnscache.store(
                    &resolved.name,
                    &resolved.ip,
                    resolved.port,
                    Duration::from_secs(resolved.ttl),
                );
                // every queued pair for this remote gets its dialback driven
                let locals: Vec<String> = self
                    .outq
                    .get(&resolved.name)
                    .map(|queue| {
                        queue
                            .iter()
                            .filter_map(|stanza| Stanza::new(stanza.clone()).from())
                            .map(|jid| jid.domain().to_string())
                            .collect::<std::collections::HashSet<_>>()
                            .into_iter()
                            .collect()
                    })
                    .unwrap_or_default();
                for local in locals {
                    self.ensure_route(&local, &resolved.name).await;
                }
                // verify traffic waiting on the same remote
                if self.verifyq.contains_key(&resolved.name) {
                    self.ensure_authoritative(&resolved.name).await;
                }
            }
            Some(Err(name)) => {
                self.dnscache.clear_pending(&name);
                self.bounce_queue(&name, StanzaErrorCondition::RemoteServerNotFound)
                    .await;
            }
            None => debug!("unrecognized resolver answer"),
        }
    }

    /// Makes sure a connection to the authoritative server for `remote`
    /// exists, for verify traffic that needs no validated route.
    async fn ensure_authoritative(&mut self, remote: &str) {
        let Some(entry) = self.dnscache.lookup(remote) else {
            if self.dnscache.mark_pending(remote) {
                let request = dns::resolve_request(remote);
                let request_root = request.root().expect("just appended");
                let route = wrap_route(
                    &self.settings.local.resolver,
                    &self.settings.id,
                    RouteType::Unicast,
                    Some((&request, request_root)),
                );
                let _ = self.router.send(route).await;
            }
            return;
        };
        let ipport = entry.ipport();
        match self.out_by_ipport.get(&ipport).copied() {
            Some(conn_id) => {
                if self
                    .conns
                    .get(&conn_id)
                    .map(|c| c.online)
                    .unwrap_or(false)
                {
                    self.flush_verifyq(conn_id, remote).await;
                }
            }
            None => {
                self.open_outgoing(remote, &entry.ip, entry.port, &ipport);
            }
        }
    }

    async fn flush_verifyq(&mut self, conn_id: u64, remote: &str) {
        let Some(requests) = self.verifyq.remove(remote) else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        for request in requests {
            conn.verify += 1;
            conn.last_verify = Instant::now();
            let _ = conn.commands.send(PeerCommand::Send(request)).await;
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Accepted {
                conn,
                commands,
                ipport,
            } => {
                self.conns
                    .insert(conn, Conn::new(Direction::Incoming, commands, ipport));
            }
            PeerEvent::OutOpen {
                conn: conn_id,
                stream_id,
                ssf,
            } => {
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return;
                };
                conn.online = true;
                conn.stream_id = Some(stream_id);
                conn.ssf = ssf;
                conn.last_activity = Instant::now();
                let remote = conn.remote.clone();
                let pending: Vec<String> = conn
                    .routes
                    .iter()
                    .filter(|entry| *entry.1 == RouteState::None)
                    .map(|entry| entry.0.clone())
                    .collect();
                for key in pending {
                    if let Some((local, remote)) = key.split_once('/') {
                        let (local, remote) = (local.to_string(), remote.to_string());
                        self.start_dialback(conn_id, &local, &remote).await;
                    }
                }
                if let Some(remote) = remote {
                    self.flush_verifyq(conn_id, &remote).await;
                }
            }
            PeerEvent::InOpen {
                conn: conn_id,
                stream_id,
                ssf,
            } => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.online = true;
                    conn.stream_id = Some(stream_id);
                    conn.ssf = ssf;
                    conn.last_activity = Instant::now();
                }
            }
            PeerEvent::Element { conn: conn_id, nad } => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.last_activity = Instant::now();
                }
                self.handle_peer_element(conn_id, nad).await;
            }
            PeerEvent::Closed { conn: conn_id } => self.drop_conn(conn_id).await,
        }
    }

    async fn handle_peer_element(&mut self, conn_id: u64, nad: Nad) {
        let Some(root) = nad.root() else { return };
        let name = nad.name(root).to_string();
        let ns = nad.ns_uri(root).map(str::to_string);
        let has_type = nad.attr_val(root, "type").is_some();

        match (name.as_str(), ns.as_deref()) {
            ("result", Some(namespaces::XMPP_DIALBACK)) if has_type => {
                self.handle_result_response(conn_id, &nad).await;
            }
            ("result", Some(namespaces::XMPP_DIALBACK)) => {
                self.handle_result_request(conn_id, &nad).await;
            }
            ("verify", Some(namespaces::XMPP_DIALBACK)) if has_type => {
                self.handle_verify_response(conn_id, &nad).await;
            }
            ("verify", Some(namespaces::XMPP_DIALBACK)) => {
                self.handle_verify_request(conn_id, &nad).await;
            }
            (_, Some(namespaces::XMPP_SERVER)) => {
                self.handle_inbound_stanza(conn_id, &nad).await;
            }
            _ => debug!(conn = conn_id, "unhandled peer element"),
        }
    }

    /// Incoming `<db:result>`: the peer claims a pair; verify through the
    /// authoritative server.
    async fn handle_result_request(&mut self, conn_id: u64, nad: &Nad) {
        let root = nad.root().expect("checked by caller");
        let (Some(remote), Some(local)) = (nad.attr_val(root, "from"), nad.attr_val(root, "to"))
        else {
            return;
        };
        let (remote, local) = (remote.to_string(), local.to_string());
        let peer_key = nad.text(root);

        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if self.settings.security.require_tls && conn.ssf == 0 {
            let _ = conn
                .commands
                .send(PeerCommand::Fail(StreamErrorCondition::PolicyViolation))
                .await;
            return;
        }
        if !self.whitelist.permits(&remote) {
            info!(%remote, "incoming peer not whitelisted");
            let _ = conn
                .commands
                .send(PeerCommand::Fail(StreamErrorCondition::PolicyViolation))
                .await;
            return;
        }
        let Some(stream_id) = conn.stream_id.clone() else {
            return;
        };

        conn.set_state(&route_key(&local, &remote), RouteState::InProgress);
        self.pending_verify.insert(stream_id.clone(), conn_id);
        let verify = dialback::verify_request(&local, &remote, &stream_id, &peer_key);
        self.verifyq.entry(remote.clone()).or_default().push(verify);
        self.ensure_authoritative(&remote).await;
    }

    /// `<db:verify>` asking us, as the authoritative server, whether a key
    /// is ours.
    async fn handle_verify_request(&mut self, conn_id: u64, nad: &Nad) {
        let root = nad.root().expect("checked by caller");
        let (Some(remote), Some(local), Some(id)) = (
            nad.attr_val(root, "from"),
            nad.attr_val(root, "to"),
            nad.attr_val(root, "id"),
        ) else {
            return;
        };
        let expected = db_key(&self.secret, remote, id);
        let valid = expected == nad.text(root);
        let response = dialback::verify_response(local, remote, id, valid);
        if let Some(conn) = self.conns.get(&conn_id) {
            let _ = conn.commands.send(PeerCommand::Send(response)).await;
        }
    }

    /// `<db:verify type='…'>` answering a verify we sent for an incoming
    /// `<db:result>`.
    async fn handle_verify_response(&mut self, answering_conn: u64, nad: &Nad) {
        if let Some(conn) = self.conns.get_mut(&answering_conn) {
            conn.verify = conn.verify.saturating_sub(1);
        }
        let root = nad.root().expect("checked by caller");
        let (Some(remote), Some(local), Some(id)) = (
            nad.attr_val(root, "from"),
            nad.attr_val(root, "to"),
            nad.attr_val(root, "id"),
        ) else {
            return;
        };
        let valid = nad.attr_val(root, "type") == Some("valid");
        let Some(in_conn_id) = self.pending_verify.remove(id) else {
            debug!("verify answer for unknown id");
            return;
        };
        let Some(conn) = self.conns.get_mut(&in_conn_id) else {
            return;
        };
        conn.set_state(
            &route_key(local, remote),
            if valid {
                RouteState::Valid
            } else {
                RouteState::Invalid
            },
        );
        let response = dialback::result_response(local, remote, valid);
        let _ = conn.commands.send(PeerCommand::Send(response)).await;
        if valid {
            info!(%local, %remote, "incoming route validated");
        } else {
            let _ = conn.commands.send(PeerCommand::Close).await;
        }
    }

    /// `<db:result type='…'>` answering our own dialback request.
    async fn handle_result_response(&mut self, conn_id: u64, nad: &Nad) {
        let root = nad.root().expect("checked by caller");
        let (Some(remote), Some(local)) = (nad.attr_val(root, "from"), nad.attr_val(root, "to"))
        else {
            return;
        };
        let (remote, local) = (remote.to_string(), local.to_string());
        let valid = nad.attr_val(root, "type") == Some("valid");
        let key = route_key(&local, &remote);

        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if valid {
            conn.set_state(&key, RouteState::Valid);
            info!(%local, %remote, "outgoing route validated");
            self.flush_outq(conn_id, &local, &remote).await;
        } else {
            conn.set_state(&key, RouteState::Invalid);
            warn!(%local, %remote, "dialback refused");
            let _ = conn.commands.send(PeerCommand::Close).await;
            self.bounce_queue(&remote, StanzaErrorCondition::RemoteServerNotFound)
                .await;
        }
    }

    /// A stanza from a peer: only pairs validated on that connection are
    /// accepted, then it heads for the router.
    async fn handle_inbound_stanza(&mut self, conn_id: u64, nad: &Nad) {
        let root = nad.root().expect("checked by caller");
        let parsed = Stanza::new(nad.clone());
        let (Some(to), Some(from)) = (parsed.to(), parsed.from()) else {
            debug!(conn = conn_id, "peer stanza without addressing, dropping");
            return;
        };
        let key = route_key(to.domain(), from.domain());

        let valid = self
            .conns
            .get_mut(&conn_id)
            .map(|conn| {
                conn.last_packet = Instant::now();
                conn.routes.get(&key) == Some(&RouteState::Valid)
            })
            .unwrap_or(false);
        if !valid {
            debug!(conn = conn_id, %key, "stanza on unvalidated route, dropping");
            return;
        }

        let mut client_ns = Nad::new();
        let copied = client_ns.append_nad_mapped(
            None,
            nad,
            root,
            Some((namespaces::XMPP_SERVER, namespaces::XMPP_CLIENT)),
        );
        let route = wrap_route(
            &to.to_string(),
            &self.settings.id,
            RouteType::Unicast,
            Some((&client_ns, copied)),
        );
        let _ = self.router.send(route).await;
    }

    /// Sends every queued stanza for the now-valid pair, in arrival order.
    async fn flush_outq(&mut self, conn_id: u64, local: &str, remote: &str) {
        let Some(queue) = self.outq.get_mut(remote) else {
            return;
        };
        let mut keep = VecDeque::new();
        let mut send = Vec::new();
        while let Some(stanza) = queue.pop_front() {
            let matches = Stanza::new(stanza.clone())
                .from()
                .map(|jid| jid.domain() == local)
                .unwrap_or(false);
            if matches {
                send.push(stanza);
            } else {
                keep.push_back(stanza);
            }
        }
        if keep.is_empty() {
            self.outq.remove(remote);
        } else {
            *self.outq.get_mut(remote).expect("still present") = keep;
        }
        for stanza in send {
            self.send_stanza(conn_id, &stanza).await;
        }
    }

    async fn send_stanza(&mut self, conn_id: u64, stanza: &Nad) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let root = stanza.root().expect("stanzas have a root");
        let mut server_ns = Nad::new();
        server_ns.append_nad_mapped(
            None,
            stanza,
            root,
            Some((namespaces::XMPP_CLIENT, namespaces::XMPP_SERVER)),
        );
        conn.last_activity = Instant::now();
        let _ = conn.commands.send(PeerCommand::Send(server_ns)).await;
    }

    async fn bounce_stanza(&mut self, stanza: &Nad, condition: StanzaErrorCondition) {
        let Some(reply) = Stanza::new(stanza.clone()).error_reply(condition) else {
            return;
        };
        let Some(to) = reply.to() else { return };
        let reply_root = reply.nad.root().expect("reply has a root");
        let route = wrap_route(
            &to.to_string(),
            &self.settings.id,
            RouteType::Unicast,
            Some((&reply.nad, reply_root)),
        );
        let _ = self.router.send(route).await;
    }

    async fn bounce_queue(&mut self, remote: &str, condition: StanzaErrorCondition) {
        let Some(queue) = self.outq.remove(remote) else {
            return;
        };
        info!(%remote, count = queue.len(), error = condition.name(), "bouncing queued stanzas");
        for stanza in queue {
            self.bounce_stanza(&stanza, condition).await;
        }
    }

    async fn drop_conn(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        self.out_by_ipport.retain(|_, &mut c| c != conn_id);
        self.pending_verify.retain(|_, &mut c| c != conn_id);

        if conn.dir == Direction::Outgoing {
            let mut remotes: Vec<String> = conn
                .routes
                .keys()
                .filter_map(|key| key.split_once('/').map(|(_, r)| r.to_string()))
                .collect();
            if let Some(remote) = conn.remote {
                remotes.push(remote);
            }
            remotes.sort();
            remotes.dedup();
            for remote in remotes {
                self.bounce_queue(&remote, StanzaErrorCondition::RemoteServerTimeout)
                    .await;
            }
        }
        debug!(conn = conn_id, "peer connection dropped");
    }

    /// The periodic sweep over connections, routes and pending resolves.
    async fn reap(&mut self) {
        let queue_limit = Duration::from_secs(self.settings.check.queue);
        let now = Instant::now();
        let mut to_close: Vec<(u64, StreamErrorCondition)> = Vec::new();
        let mut to_bounce: Vec<String> = Vec::new();

        for (&conn_id, conn) in &self.conns {
            let stalled: Vec<String> = conn
                .routes
                .iter()
                .filter(|entry| {
                    *entry.1 == RouteState::InProgress
                        && conn
                            .states_time
                            .get(entry.0)
                            .map(|&t| now.duration_since(t) > queue_limit)
                            .unwrap_or(true)
                })
                .map(|entry| entry.0.clone())
                .collect();
            if !stalled.is_empty() {
                to_close.push((conn_id, StreamErrorCondition::ConnectionTimeout));
                for key in stalled {
                    if let Some((_, remote)) = key.split_once('/') {
                        to_bounce.push(remote.to_string());
                    }
                }
                continue;
            }

            if conn.verify > 0 && now.duration_since(conn.last_verify) > queue_limit {
                to_close.push((conn_id, StreamErrorCondition::ConnectionTimeout));
                continue;
            }

            if conn.dir == Direction::Outgoing
                && !conn.online
                && now.duration_since(conn.init_time) > queue_limit
            {
                to_close.push((conn_id, StreamErrorCondition::ConnectionTimeout));
                if let Some(remote) = &conn.remote {
                    to_bounce.push(remote.clone());
                }
                continue;
            }

            if conn.dir == Direction::Incoming
                && conn.routes.is_empty()
                && now.duration_since(conn.init_time) > queue_limit
            {
                to_close.push((conn_id, StreamErrorCondition::ConnectionTimeout));
                continue;
            }

            if self.settings.check.idle > 0
                && now.duration_since(conn.last_packet).as_secs() > self.settings.check.idle
            {
                to_close.push((conn_id, StreamErrorCondition::ConnectionTimeout));
                continue;
            }

            if self.settings.check.keepalive > 0
                && now.duration_since(conn.last_activity).as_secs()
                    > self.settings.check.keepalive
            {
                let _ = conn.commands.send(PeerCommand::Keepalive).await;
            }
        }

        for (conn_id, condition) in to_close {
            if let Some(conn) = self.conns.get(&conn_id) {
                let _ = conn.commands.send(PeerCommand::Fail(condition)).await;
            }
            self.drop_conn(conn_id).await;
        }
        for remote in to_bounce {
            self.bounce_queue(&remote, StanzaErrorCondition::RemoteServerTimeout)
                .await;
        }

        for name in self.dnscache.stale_pending(queue_limit) {
            self.dnscache.clear_pending(&name);
            self.bounce_queue(&name, StanzaErrorCondition::RemoteServerNotFound)
                .await;
        }
    }
}

#[derive(Clone)]
pub struct GatewayHandle {
    events: mpsc::Sender<GatewayEvent>,
    peer_events: mpsc::Sender<PeerEvent>,
    conn_ids: Arc<AtomicU64>,
}

impl GatewayHandle {
    /// Spawns the gateway actor. `router` carries router-bound `<route/>`
    /// envelopes; the caller wires it into the uplink.
    pub fn spawn(settings: Arc<Settings>, tls: PeerTls, router: mpsc::Sender<Nad>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (peer_tx, peer_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let conn_ids = Arc::new(AtomicU64::new(1));
        let mut gateway = Gateway {
            events: events_rx,
            peer_events: peer_rx,
            peer_events_tx: peer_tx.clone(),
            router,
            secret: settings.secret(),
            whitelist: Whitelist::new(
                settings.security.enable_whitelist,
                &settings.security.whitelist_domain,
            ),
            tls,
            settings,
            conn_ids: conn_ids.clone(),
            conns: HashMap::new(),
            out_by_ipport: HashMap::new(),
            outq: HashMap::new(),
            verifyq: HashMap::new(),
            pending_verify: HashMap::new(),
            dnscache: DnsCache::new(),
        };
        tokio::spawn(async move {
            gateway.run().await;
        });
        Self {
            events: events_tx,
            peer_events: peer_tx,
            conn_ids,
        }
    }

    pub async fn packet(&self, nad: Nad) {
        let _ = self.events.send(GatewayEvent::Packet(nad)).await;
    }

    pub async fn accepted(&self, conn: u64, commands: mpsc::Sender<PeerCommand>, ipport: String) {
        let _ = self
            .peer_events
            .send(PeerEvent::Accepted {
                conn,
                commands,
                ipport,
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(GatewayEvent::Shutdown).await;
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peer_sender(&self) -> mpsc::Sender<PeerEvent> {
        self.peer_events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{LocalSettings, RouterSettings};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SECRET: &str = "s3cr3t";

    fn test_settings() -> Settings {
        Settings {
            id: "s2s.example.net".to_string(),
            router: RouterSettings {
                ip: "127.0.0.1".to_string(),
                port: 5347,
                user: "s2s-user".to_string(),
                pass: "s2s-secret".to_string(),
                use_tls: false,
                retry: Default::default(),
            },
            local: LocalSettings {
                ip: "127.0.0.1".to_string(),
                port: 0,
                pemfile: None,
                secret: Some(SECRET.to_string()),
                resolver: "resolver".to_string(),
            },
            check: Default::default(),
            security: Default::default(),
            io: Default::default(),
            pidfile: None,
        }
    }

    fn spawn_gateway(settings: Settings) -> (GatewayHandle, mpsc::Receiver<Nad>) {
        let (router_tx, router_rx) = mpsc::channel(32);
        let handle = GatewayHandle::spawn(
            Arc::new(settings),
            PeerTls {
                server: None,
                client: None,
            },
            router_tx,
        );
        (handle, router_rx)
    }

    fn message_route_with_body(body_text: &str) -> Nad {
        let mut message = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = message.root().unwrap();
        message.append_attr(root, "from", "alice@example.net");
        message.append_attr(root, "to", "bob@remote.example");
        let body = message.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        message.append_text(body, body_text);
        wrap_route(
            "bob@remote.example",
            "sm.example.net",
            RouteType::Unicast,
            Some((&message, root)),
        )
    }

    fn message_route() -> Nad {
        message_route_with_body("hello bob")
    }

    fn resolved_route(ip: &str, port: u16) -> Nad {
        let mut answer = Nad::with_root("resolve", Some(dns::NS_RESOLVER));
        let root = answer.root().unwrap();
        answer.append_attr(root, "name", "remote.example");
        answer.append_attr(root, "ip", ip);
        answer.append_attr(root, "port", &port.to_string());
        answer.append_attr(root, "ttl", "300");
        wrap_route(
            "s2s.example.net",
            "resolver",
            RouteType::Unicast,
            Some((&answer, root)),
        )
    }

    async fn read_until(sock: &mut TcpStream, needle: &str) -> String {
        let mut collected = String::new();
        let mut buf = [0u8; 2048];
        loop {
            if collected.contains(needle) {
                return collected;
            }
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed while waiting for {needle}");
            collected.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
    }

    #[tokio::test]
    async fn unresolved_domain_asks_the_resolver() {
        let (gateway, mut router_rx) = spawn_gateway(test_settings());
        gateway.packet(message_route()).await;

        let request = router_rx.recv().await.unwrap();
        let view = RouteView::parse(&request).unwrap();
        assert_eq!(view.to.as_deref(), Some("resolver"));
        let payload = view.payload.unwrap();
        assert_eq!(request.name(payload), "resolve");
        assert_eq!(request.attr_val(payload, "name"), Some("remote.example"));
    }

    #[tokio::test]
    async fn unreachable_peer_bounces_the_queue() {
        // grab a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (gateway, mut router_rx) = spawn_gateway(test_settings());
        gateway.packet(message_route()).await;
        let _resolve = router_rx.recv().await.unwrap();
        gateway.packet(resolved_route("127.0.0.1", port)).await;

        let bounced = router_rx.recv().await.unwrap();
        let view = RouteView::parse(&bounced).unwrap();
        assert_eq!(view.to.as_deref(), Some("alice@example.net"));
        let payload = view.payload.unwrap();
        let error = bounced.find_child(payload, "error", bounced.ns_uri(payload));
        assert!(error.is_some());
        let error = error.unwrap();
        assert!(bounced
            .find_child(
                error,
                "remote-server-timeout",
                Some(namespaces::XMPP_STANZA_ERRORS)
            )
            .is_some());
    }

    #[tokio::test]
    async fn outgoing_dialback_validates_and_flushes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let expected_key = db_key(SECRET, "remote.example", "TESTID");
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_until(&mut sock, ">").await;
            sock.write_all(
                b"<?xml version='1.0'?><stream:stream xmlns=\"jabber:server\" \
                  xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns:db=\"jabber:server:dialback\" id=\"TESTID\">",
            )
            .await
            .unwrap();

            let result = read_until(&mut sock, "</result>").await;
            assert!(result.contains("from=\"example.net\""));
            assert!(result.contains("to=\"remote.example\""));
            assert!(result.contains(&expected_key), "dialback key mismatch");

            sock.write_all(
                b"<result xmlns=\"jabber:server:dialback\" from=\"remote.example\" \
                  to=\"example.net\" type=\"valid\"/>",
            )
            .await
            .unwrap();

            read_until(&mut sock, "second of two").await
        });

        let (gateway, mut router_rx) = spawn_gateway(test_settings());
        gateway.packet(message_route_with_body("first of two")).await;
        gateway.packet(message_route_with_body("second of two")).await;
        let _resolve = router_rx.recv().await.unwrap();
        gateway
            .packet(resolved_route("127.0.0.1", addr.port()))
            .await;

        let flushed = server.await.unwrap();
        assert!(flushed.contains("xmlns=\"jabber:server\""));
        assert!(flushed.contains("to=\"bob@remote.example\""));
        // queued stanzas never reorder relative to insertion
        let first = flushed.find("first of two").unwrap();
        let second = flushed.find("second of two").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn authoritative_verify_answers_valid_for_our_key() {
        let (gateway, _router_rx) = spawn_gateway(test_settings());
        let conn = gateway.next_conn_id();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        gateway.accepted(conn, cmd_tx, "192.0.2.9/5269".to_string()).await;

        let peers = gateway.peer_sender();
        peers
            .send(PeerEvent::InOpen {
                conn,
                stream_id: "OURSID".to_string(),
                ssf: 0,
            })
            .await
            .unwrap();
        let key = db_key(SECRET, "asker.example", "XYZ");
        peers
            .send(PeerEvent::Element {
                conn,
                nad: dialback::verify_request("example.net", "asker.example", "XYZ", &key),
            })
            .await
            .unwrap();

        match cmd_rx.recv().await.unwrap() {
            PeerCommand::Send(nad) => {
                let root = nad.root().unwrap();
                assert_eq!(nad.name(root), "verify");
                assert_eq!(nad.attr_val(root, "type"), Some("valid"));
                assert_eq!(nad.attr_val(root, "id"), Some("XYZ"));
            }
            other => panic!("expected verify response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn authoritative_verify_rejects_a_forged_key() {
        let (gateway, _router_rx) = spawn_gateway(test_settings());
        let conn = gateway.next_conn_id();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        gateway.accepted(conn, cmd_tx, "192.0.2.9/5269".to_string()).await;

        let peers = gateway.peer_sender();
        peers
            .send(PeerEvent::InOpen {
                conn,
                stream_id: "OURSID".to_string(),
                ssf: 0,
            })
            .await
            .unwrap();
        peers
            .send(PeerEvent::Element {
                conn,
                nad: dialback::verify_request("example.net", "asker.example", "XYZ", "bogus"),
            })
            .await
            .unwrap();

        match cmd_rx.recv().await.unwrap() {
            PeerCommand::Send(nad) => {
                let root = nad.root().unwrap();
                assert_eq!(nad.attr_val(root, "type"), Some("invalid"));
            }
            other => panic!("expected verify response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn whitelisted_destinations_only() {
        let mut settings = test_settings();
        settings.security.enable_whitelist = true;
        settings.security.whitelist_domain = vec!["friendly.example".to_string()];
        let (gateway, mut router_rx) = spawn_gateway(settings);

        gateway.packet(message_route()).await;
        let bounced = router_rx.recv().await.unwrap();
        let view = RouteView::parse(&bounced).unwrap();
        assert_eq!(view.to.as_deref(), Some("alice@example.net"));
        let payload = view.payload.unwrap();
        assert_eq!(bounced.attr_val(payload, "type"), Some("error"));
    }
}
