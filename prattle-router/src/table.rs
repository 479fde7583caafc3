use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use prattle_core::acl::AccessControl;
use prattle_core::component::{wrap_route, RouteType, RouteView};
use prattle_core::xml::Nad;
use prattle_core::xmpp::error::StanzaErrorCondition;
use prattle_core::xmpp::jid::{Jid, PrepCache};
use prattle_core::xmpp::stanza::Stanza;

use crate::message_log::MessageLog;
use crate::settings::Settings;

const COMMAND_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    NotAuthorized,
    Conflict,
    InvalidName,
}

impl BindError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAuthorized => "not-authorized",
            Self::Conflict => "conflict",
            Self::InvalidName => "bad-request",
        }
    }
}

pub enum TableCommand {
    Attach {
        conn: u64,
        user: String,
        sender: mpsc::Sender<Nad>,
    },
    Bind {
        conn: u64,
        name: String,
        log_sink: bool,
        reply: oneshot::Sender<Result<String, BindError>>,
    },
    Unbind {
        conn: u64,
        name: String,
    },
    Detach {
        conn: u64,
    },
    Route {
        conn: u64,
        nad: Nad,
    },
    RotateLog,
}

struct ComponentEntry {
    user: String,
    sender: mpsc::Sender<Nad>,
    names: HashSet<String>,
    log_sink: bool,
}

/// Owns the name-to-stream table, aliases, log sinks and the message log.
/// One task; every mutation arrives as a [`TableCommand`].
pub struct RoutingTable {
    commands: mpsc::Receiver<TableCommand>,
    id: String,
    acl: AccessControl,
    aliases: HashMap<String, String>,
    default_route: Option<String>,
    multi: HashSet<String>,
    components: HashMap<u64, ComponentEntry>,
    routes: HashMap<String, Vec<u64>>,
    prep: PrepCache,
    message_log: Option<MessageLog>,
}

impl RoutingTable {
    async fn run(&mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                TableCommand::Attach { conn, user, sender } => {
                    self.components.insert(
                        conn,
                        ComponentEntry {
                            user,
                            sender,
                            names: HashSet::new(),
                            log_sink: false,
                        },
                    );
                }
                TableCommand::Bind {
                    conn,
                    name,
                    log_sink,
                    reply,
                } => {
                    let _ = reply.send(self.bind(conn, &name, log_sink));
                }
                TableCommand::Unbind { conn, name } => self.unbind(conn, &name),
                TableCommand::Detach { conn } => self.detach(conn),
                TableCommand::Route { conn, nad } => self.route(conn, nad).await,
                TableCommand::RotateLog => {
                    if let Some(log) = self.message_log.as_mut() {
                        log.force_rotate();
                    }
                }
            }
        }
    }

    fn bind(&mut self, conn: u64, name: &str, log_sink: bool) -> Result<String, BindError> {
        let Some(component) = self.components.get(&conn) else {
            return Err(BindError::NotAuthorized);
        };
        if !self.acl.allows("bind", &component.user) {
            return Err(BindError::NotAuthorized);
        }
        if log_sink && !self.acl.allows("log", &component.user) {
            return Err(BindError::NotAuthorized);
        }
        let name = self
            .prep
            .domain(name)
            .map_err(|_| BindError::InvalidName)?;

        let bound = self.routes.entry(name.clone()).or_default();
        if !bound.is_empty() && !self.multi.contains(&name) {
            return Err(BindError::Conflict);
        }
        bound.push(conn);

        let component = self.components.get_mut(&conn).expect("checked above");
        component.names.insert(name.clone());
        if log_sink {
            component.log_sink = true;
        }
        info!(name = %name, user = %component.user, "route bound");
        Ok(name)
    }

    fn unbind(&mut self, conn: u64, name: &str) {
        let Ok(name) = self.prep.domain(name) else {
            return;
        };
        if let Some(bound) = self.routes.get_mut(&name) {
            bound.retain(|&c| c != conn);
            if bound.is_empty() {
                self.routes.remove(&name);
            }
        }
        if let Some(component) = self.components.get_mut(&conn) {
            component.names.remove(&name);
        }
        info!(name = %name, "route unbound");
    }

    fn detach(&mut self, conn: u64) {
        let Some(component) = self.components.remove(&conn) else {
            return;
        };
        for name in component.names {
            if let Some(bound) = self.routes.get_mut(&name) {
                bound.retain(|&c| c != conn);
                if bound.is_empty() {
                    self.routes.remove(&name);
                }
            }
            info!(name = %name, "route dropped with its component");
        }
    }

    async fn route(&mut self, conn: u64, nad: Nad) {
        let Some(view) = RouteView::parse(&nad) else {
            debug!("dropping non-route element from component");
            return;
        };

        let Some(source) = self.components.get(&conn) else {
            return;
        };
        if !self.acl.allows("route", &source.user) {
            self.bounce(
                conn,
                &nad,
                &view,
                "not-authorized",
                StanzaErrorCondition::Forbidden,
            )
            .await;
            return;
        }

        self.log_message(&nad, &view);

        if view.route_type == RouteType::Broadcast {
            self.broadcast(conn, &nad).await;
            return;
        }

        let Some(domain) = view
            .to
            .as_deref()
            .and_then(|to| to.parse::<Jid>().ok())
            .map(|jid| jid.domain().to_string())
        else {
            self.bounce(
                conn,
                &nad,
                &view,
                "bad-request",
                StanzaErrorCondition::BadRequest,
            )
            .await;
            return;
        };
        let domain = match self.aliases.get(&domain) {
            Some(target) => target.clone(),
            None => domain,
        };

        let target = match self.routes.get(&domain).and_then(|bound| bound.first()) {
            Some(&target) => Some(target),
            None if domain != self.id => self
                .default_route
                .as_ref()
                .filter(|name| !name.as_str().eq(&domain))
                .and_then(|name| self.routes.get(name))
                .and_then(|bound| bound.first())
                .copied(),
            None => None,
        };

        let Some(target) = target else {
            self.bounce(
                conn,
                &nad,
                &view,
                "host-unknown",
                StanzaErrorCondition::RemoteServerNotFound,
            )
            .await;
            return;
        };

        self.deliver(target, nad.clone()).await;
        self.copy_to_log_sinks(conn, target, &nad).await;
    }

    async fn broadcast(&mut self, source: u64, nad: &Nad) {
        let targets: Vec<u64> = self
            .components
            .keys()
            .copied()
            .filter(|&conn| conn != source)
            .collect();
        for target in targets {
            self.deliver(target, nad.clone()).await;
        }
    }

    async fn deliver(&mut self, conn: u64, nad: Nad) {
        let Some(component) = self.components.get(&conn) else {
            return;
        };
        if component.sender.send(nad).await.is_err() {
            warn!("component stream is gone, detaching");
            self.detach(conn);
        }
    }

    async fn copy_to_log_sinks(&mut self, source: u64, target: u64, nad: &Nad) {
        let sinks: Vec<u64> = self
            .components
            .iter()
            .filter(|(&conn, entry)| entry.log_sink && conn != source && conn != target)
            .map(|(&conn, _)| conn)
            .collect();
        for sink in sinks {
            self.deliver(sink, nad.clone()).await;
        }
    }

    fn log_message(&mut self, nad: &Nad, view: &RouteView) {
        let Some(log) = self.message_log.as_mut() else {
            return;
        };
        let Some(payload) = view.payload else { return };
        let mut standalone = Nad::new();
        standalone.append_nad(None, nad, payload);
        log.log(&Stanza::new(standalone));
    }

    /// Returns the packet to its source with an error mark on the envelope
    /// and a stanza error in the payload.
    async fn bounce(
        &mut self,
        conn: u64,
        nad: &Nad,
        view: &RouteView,
        route_error: &str,
        condition: StanzaErrorCondition,
    ) {
        debug!(error = route_error, "bouncing route");
        let Some(payload) = view.payload else { return };

        let mut standalone = Nad::new();
        standalone.append_nad(None, nad, payload);
        let Some(reply) = Stanza::new(standalone).error_reply(condition) else {
            return;
        };
        let reply_root = reply.nad.root().expect("reply has a root");

        let to = view.from.as_deref().unwrap_or_default();
        let from = view.to.as_deref().unwrap_or(&self.id);
        let mut bounced = wrap_route(to, from, RouteType::Unicast, Some((&reply.nad, reply_root)));
        let bounced_root = bounced.root().expect("just appended");
        bounced.set_attr(bounced_root, "error", route_error);

        self.deliver(conn, bounced).await;
    }
}

#[derive(Clone)]
pub struct TableHandle {
    commands: mpsc::Sender<TableCommand>,
}

impl TableHandle {
    pub fn spawn(settings: &Settings) -> Self {
        let message_log = if settings.message_logging.enable {
            match MessageLog::open(&settings.message_logging) {
                Ok(log) => Some(log),
                Err(error) => {
                    warn!(%error, "message logging disabled");
                    None
                }
            }
        } else {
            None
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let mut table = RoutingTable {
            commands: commands_rx,
            id: settings.id.clone(),
            acl: AccessControl::new(settings.aci.clone()),
            aliases: settings.aliases.clone(),
            default_route: settings.default_route.clone(),
            multi: settings.multi.iter().cloned().collect(),
            components: HashMap::new(),
            routes: HashMap::new(),
            prep: PrepCache::default(),
            message_log,
        };
        tokio::spawn(async move {
            table.run().await;
        });

        TableHandle {
            commands: commands_tx,
        }
    }

    pub async fn attach(&self, conn: u64, user: &str, sender: mpsc::Sender<Nad>) {
        let _ = self
            .commands
            .send(TableCommand::Attach {
                conn,
                user: user.to_string(),
                sender,
            })
            .await;
    }

    pub async fn bind(&self, conn: u64, name: &str, log_sink: bool) -> Result<String, BindError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(TableCommand::Bind {
                conn,
                name: name.to_string(),
                log_sink,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.unwrap_or(Err(BindError::NotAuthorized))
    }

    pub async fn unbind(&self, conn: u64, name: &str) {
        let _ = self
            .commands
            .send(TableCommand::Unbind {
                conn,
                name: name.to_string(),
            })
            .await;
    }

    pub async fn detach(&self, conn: u64) {
        let _ = self.commands.send(TableCommand::Detach { conn }).await;
    }

    pub async fn route(&self, conn: u64, nad: Nad) {
        let _ = self.commands.send(TableCommand::Route { conn, nad }).await;
    }

    pub async fn rotate_log(&self) {
        let _ = self.commands.send(TableCommand::RotateLog).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prattle_core::xml::namespaces;

    fn test_settings() -> Settings {
        Settings {
            id: "router.example.net".to_string(),
            local: crate::settings::LocalSettings {
                ip: "127.0.0.1".to_string(),
                port: 5347,
                pemfile: None,
            },
            users: HashMap::new(),
            realm: None,
            aci: HashMap::from([(
                "all".to_string(),
                vec!["c2s-user".to_string(), "s2s-user".to_string()],
            )]),
            aliases: HashMap::from([(
                "chat.example.net".to_string(),
                "muc.internal".to_string(),
            )]),
            default_route: Some("s2s.example.net".to_string()),
            multi: vec![],
            io: Default::default(),
            message_logging: Default::default(),
            pidfile: None,
        }
    }

    fn message_route(to: &str, from: &str) -> Nad {
        let mut inner = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = inner.root().unwrap();
        inner.append_attr(root, "to", to);
        inner.append_attr(root, "from", from);
        wrap_route(to, from, RouteType::Unicast, Some((&inner, root)))
    }

    async fn attach_and_bind(
        table: &TableHandle,
        conn: u64,
        user: &str,
        name: &str,
    ) -> mpsc::Receiver<Nad> {
        let (tx, rx) = mpsc::channel(8);
        table.attach(conn, user, tx).await;
        table.bind(conn, name, false).await.unwrap();
        rx
    }

    #[tokio::test]
    async fn routes_to_bound_component() {
        let table = TableHandle::spawn(&test_settings());
        let _c2s = attach_and_bind(&table, 1, "c2s-user", "c2s.example.net").await;
        let mut sm = attach_and_bind(&table, 2, "s2s-user", "sm.example.net").await;

        table
            .route(1, message_route("alice@sm.example.net", "bob@c2s.example.net"))
            .await;
        let delivered = sm.recv().await.unwrap();
        let view = RouteView::parse(&delivered).unwrap();
        assert_eq!(view.to.as_deref(), Some("alice@sm.example.net"));
    }

    #[tokio::test]
    async fn alias_rewrites_destination_domain() {
        let table = TableHandle::spawn(&test_settings());
        let _src = attach_and_bind(&table, 1, "c2s-user", "c2s.example.net").await;
        let mut muc = attach_and_bind(&table, 2, "s2s-user", "muc.internal").await;

        table
            .route(1, message_route("room@chat.example.net", "a@c2s.example.net"))
            .await;
        assert!(muc.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_domain_falls_through_to_default_route() {
        let table = TableHandle::spawn(&test_settings());
        let _src = attach_and_bind(&table, 1, "c2s-user", "c2s.example.net").await;
        let mut s2s = attach_and_bind(&table, 2, "s2s-user", "s2s.example.net").await;

        table
            .route(1, message_route("bob@remote.example", "a@c2s.example.net"))
            .await;
        let delivered = s2s.recv().await.unwrap();
        let view = RouteView::parse(&delivered).unwrap();
        assert_eq!(view.to.as_deref(), Some("bob@remote.example"));
    }

    #[tokio::test]
    async fn unknown_local_domain_bounces() {
        let mut settings = test_settings();
        settings.default_route = None;
        let table = TableHandle::spawn(&settings);
        let mut src = attach_and_bind(&table, 1, "c2s-user", "c2s.example.net").await;

        table
            .route(1, message_route("x@nowhere.example", "a@c2s.example.net"))
            .await;
        let bounced = src.recv().await.unwrap();
        let view = RouteView::parse(&bounced).unwrap();
        assert_eq!(view.error.as_deref(), Some("host-unknown"));
        assert_eq!(view.to.as_deref(), Some("a@c2s.example.net"));
    }

    #[tokio::test]
    async fn exclusive_names_conflict() {
        let table = TableHandle::spawn(&test_settings());
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        table.attach(1, "c2s-user", tx1).await;
        table.attach(2, "s2s-user", tx2).await;

        table.bind(1, "sm.example.net", false).await.unwrap();
        assert_eq!(
            table.bind(2, "sm.example.net", false).await,
            Err(BindError::Conflict)
        );
    }

    #[tokio::test]
    async fn multi_names_allow_several_binds() {
        let mut settings = test_settings();
        settings.multi = vec!["sm.example.net".to_string()];
        let table = TableHandle::spawn(&settings);
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        table.attach(1, "c2s-user", tx1).await;
        table.attach(2, "s2s-user", tx2).await;

        table.bind(1, "sm.example.net", false).await.unwrap();
        assert!(table.bind(2, "sm.example.net", false).await.is_ok());
    }

    #[tokio::test]
    async fn unauthorized_user_cannot_bind() {
        let table = TableHandle::spawn(&test_settings());
        let (tx, _rx) = mpsc::channel(8);
        table.attach(1, "nobody", tx).await;
        assert_eq!(
            table.bind(1, "x.example.net", false).await,
            Err(BindError::NotAuthorized)
        );
    }

    #[tokio::test]
    async fn unbind_releases_the_name() {
        let table = TableHandle::spawn(&test_settings());
        let _a = attach_and_bind(&table, 1, "c2s-user", "sm.example.net").await;
        table.unbind(1, "sm.example.net").await;

        let (tx2, _rx2) = mpsc::channel(8);
        table.attach(2, "s2s-user", tx2).await;
        assert!(table.bind(2, "sm.example.net", false).await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_source() {
        let table = TableHandle::spawn(&test_settings());
        let mut a = attach_and_bind(&table, 1, "c2s-user", "a.example.net").await;
        let mut b = attach_and_bind(&table, 2, "s2s-user", "b.example.net").await;

        let mut inner = Nad::with_root("presence", Some(namespaces::XMPP_CLIENT));
        let root = inner.root().unwrap();
        inner.append_attr(root, "from", "x@a.example.net");
        let nad = wrap_route("", "a.example.net", RouteType::Broadcast, Some((&inner, root)));
        table.route(1, nad).await;

        assert!(b.recv().await.is_some());
        assert!(a.try_recv().is_err());
    }
}
