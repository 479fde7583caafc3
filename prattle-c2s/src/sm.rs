use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use prattle_core::component::{wrap_route, RouteType};
use prattle_core::xml::Nad;
use prattle_core::xmpp::error::StanzaErrorCondition;
use prattle_core::xmpp::jid::Jid;
use prattle_core::xmpp::stanza::Stanza;
use prattle_sx::uplink::UplinkHandle;

const COMMAND_CHANNEL_DEPTH: usize = 64;

/// What a session task can receive from the registry.
#[derive(Debug)]
pub enum Delivery {
    /// A stanza addressed to this session.
    Stanza(Nad),
    /// Another login took this resource; close with `conflict`.
    Replaced,
}

enum SmCommand {
    Started {
        jid: Jid,
        sender: mpsc::Sender<Delivery>,
    },
    Ended {
        jid: Jid,
    },
    Deliver {
        stanza: Nad,
    },
}

/// Registry of bound sessions: bare JID to resource to session channel.
/// Inbound stanzas from the router are resolved here; conflicts are decided
/// here (newest login wins).
struct SessionRegistry {
    commands: mpsc::Receiver<SmCommand>,
    sessions: HashMap<Jid, HashMap<String, mpsc::Sender<Delivery>>>,
    uplink: UplinkHandle,
    component_id: String,
}

impl SessionRegistry {
    async fn run(&mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                SmCommand::Started { jid, sender } => self.started(jid, sender).await,
                SmCommand::Ended { jid } => self.ended(jid),
                SmCommand::Deliver { stanza } => self.deliver(stanza).await,
            }
        }
    }

    async fn started(&mut self, jid: Jid, sender: mpsc::Sender<Delivery>) {
        let Some(resource) = jid.resource().map(str::to_string) else {
            warn!(%jid, "session without resource ignored");
            return;
        };
        let resources = self.sessions.entry(jid.bare()).or_default();
        if let Some(old) = resources.insert(resource, sender) {
            info!(%jid, "resource conflict, replacing older session");
            let _ = old.send(Delivery::Replaced).await;
        }
    }

    fn ended(&mut self, jid: Jid) {
        let Some(resource) = jid.resource() else {
            return;
        };
        if let Some(resources) = self.sessions.get_mut(&jid.bare()) {
            resources.remove(resource);
            if resources.is_empty() {
                self.sessions.remove(&jid.bare());
            }
        }
    }

    async fn deliver(&mut self, stanza: Nad) {
        let parsed = Stanza::new(stanza.clone());
        let Some(to) = parsed.to() else {
            debug!("inbound stanza without to, dropping");
            return;
        };

        let Some(resources) = self.sessions.get(&to.bare()) else {
            self.bounce(&parsed, StanzaErrorCondition::RecipientUnavailable)
                .await;
            return;
        };

        match to.resource() {
            Some(resource) => match resources.get(resource) {
                Some(sender) => {
                    let _ = sender.send(Delivery::Stanza(stanza)).await;
                }
                None => {
                    self.bounce(&parsed, StanzaErrorCondition::RecipientUnavailable)
                        .await;
                }
            },
            // bare JID: every bound resource gets a copy
            None => {
                for sender in resources.values() {
                    let _ = sender.send(Delivery::Stanza(stanza.clone())).await;
                }
            }
        }
    }

    async fn bounce(&self, stanza: &Stanza, condition: StanzaErrorCondition) {
        let Some(reply) = stanza.error_reply(condition) else {
            return;
        };
        let Some(to) = reply.to() else { return };
        let root = reply.nad.root().expect("reply has a root");
        let route = wrap_route(
            &to.to_string(),
            &self.component_id,
            RouteType::Unicast,
            Some((&reply.nad, root)),
        );
        let _ = self.uplink.send(route).await;
    }
}

#[derive(Clone)]
pub struct SmHandle {
    commands: mpsc::Sender<SmCommand>,
}

impl SmHandle {
    pub fn spawn(component_id: &str, uplink: UplinkHandle) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let mut registry = SessionRegistry {
            commands: commands_rx,
            sessions: HashMap::new(),
            uplink,
            component_id: component_id.to_string(),
        };
        tokio::spawn(async move {
            registry.run().await;
        });
        Self {
            commands: commands_tx,
        }
    }

    pub async fn started(&self, jid: Jid, sender: mpsc::Sender<Delivery>) {
        let _ = self.commands.send(SmCommand::Started { jid, sender }).await;
    }

    pub async fn ended(&self, jid: Jid) {
        let _ = self.commands.send(SmCommand::Ended { jid }).await;
    }

    pub async fn deliver(&self, stanza: Nad) {
        let _ = self.commands.send(SmCommand::Deliver { stanza }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prattle_core::xml::namespaces;
    use prattle_sx::uplink::UplinkConfig;

    fn uplink_for_test() -> UplinkHandle {
        // an uplink that will never connect; sends still enqueue
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let config = UplinkConfig {
            ip: "127.0.0.1".to_string(),
            port: 1,
            user: "u".to_string(),
            pass: "p".to_string(),
            name: "c2s.example.net".to_string(),
            use_tls: false,
            retry_init: 1,
            retry_lost: 1,
            retry_sleep: 1,
        };
        let (handle, _task) = prattle_sx::uplink::Uplink::spawn(config, inbound_tx);
        handle
    }

    fn message_to(to: &str) -> Nad {
        let mut nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "to", to);
        nad.append_attr(root, "from", "bob@remote.example/desk");
        nad
    }

    #[tokio::test]
    async fn full_jid_reaches_the_bound_resource() {
        let uplink = uplink_for_test();
        let sm = SmHandle::spawn("c2s.example.net", uplink);
        let (tx, mut rx) = mpsc::channel(8);
        let jid: Jid = "alice@example.net/home".parse().unwrap();
        sm.started(jid, tx).await;

        sm.deliver(message_to("alice@example.net/home")).await;
        assert!(matches!(rx.recv().await, Some(Delivery::Stanza(_))));
    }

    #[tokio::test]
    async fn bare_jid_fans_out() {
        let uplink = uplink_for_test();
        let sm = SmHandle::spawn("c2s.example.net", uplink);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        sm.started("alice@example.net/home".parse().unwrap(), tx1)
            .await;
        sm.started("alice@example.net/work".parse().unwrap(), tx2)
            .await;

        sm.deliver(message_to("alice@example.net")).await;
        assert!(matches!(rx1.recv().await, Some(Delivery::Stanza(_))));
        assert!(matches!(rx2.recv().await, Some(Delivery::Stanza(_))));
    }

    #[tokio::test]
    async fn resource_conflict_replaces_the_old_session() {
        let uplink = uplink_for_test();
        let sm = SmHandle::spawn("c2s.example.net", uplink);
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);
        let jid: Jid = "alice@example.net/home".parse().unwrap();
        sm.started(jid.clone(), old_tx).await;
        sm.started(jid, new_tx).await;

        assert!(matches!(old_rx.recv().await, Some(Delivery::Replaced)));
        sm.deliver(message_to("alice@example.net/home")).await;
        assert!(matches!(new_rx.recv().await, Some(Delivery::Stanza(_))));
    }

    #[tokio::test]
    async fn ended_session_stops_receiving() {
        let uplink = uplink_for_test();
        let sm = SmHandle::spawn("c2s.example.net", uplink);
        let (tx, mut rx) = mpsc::channel(8);
        let jid: Jid = "alice@example.net/home".parse().unwrap();
        sm.started(jid.clone(), tx).await;
        sm.ended(jid).await;

        sm.deliver(message_to("alice@example.net/home")).await;
        assert!(rx.try_recv().is_err());
    }
}
