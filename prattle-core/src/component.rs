use crate::xml::{namespaces, Nad};

/// Delivery semantics of a `<route/>` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Unicast,
    Broadcast,
    Session,
}

impl RouteType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Broadcast => "broadcast",
            Self::Session => "session",
        }
    }

    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("broadcast") => Self::Broadcast,
            Some("session") => Self::Session,
            _ => Self::Unicast,
        }
    }
}

/// Wraps a stanza in the inter-component `<route/>` envelope.
pub fn wrap_route(
    to: &str,
    from: &str,
    route_type: RouteType,
    payload: Option<(&Nad, usize)>,
) -> Nad {
    let mut nad = Nad::with_root("route", Some(namespaces::COMPONENT));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "to", to);
    nad.append_attr(root, "from", from);
    if route_type != RouteType::Unicast {
        nad.append_attr(root, "type", route_type.as_str());
    }
    if let Some((payload, elem)) = payload {
        nad.append_nad(Some(root), payload, elem);
    }
    nad
}

/// A parsed view of an inbound `<route/>` envelope.
#[derive(Debug)]
pub struct RouteView {
    pub to: Option<String>,
    pub from: Option<String>,
    pub route_type: RouteType,
    pub error: Option<String>,
    pub payload: Option<usize>,
}

impl RouteView {
    pub fn parse(nad: &Nad) -> Option<Self> {
        let root = nad.root()?;
        if nad.name(root) != "route" || nad.ns_uri(root) != Some(namespaces::COMPONENT) {
            return None;
        }
        Some(Self {
            to: nad.attr_val(root, "to").map(str::to_string),
            from: nad.attr_val(root, "from").map(str::to_string),
            route_type: RouteType::parse(nad.attr_val(root, "type")),
            error: nad.attr_val(root, "error").map(str::to_string),
            payload: nad.children(root).next(),
        })
    }
}

/// `<bind name='…'/>` sent by a component to claim a route name.
pub fn bind_request(name: &str) -> Nad {
    named_request("bind", name)
}

/// `<unbind name='…'/>` releases one previously bound name.
pub fn unbind_request(name: &str) -> Nad {
    named_request("unbind", name)
}

fn named_request(kind: &str, name: &str) -> Nad {
    let mut nad = Nad::with_root(kind, Some(namespaces::COMPONENT));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "name", name);
    nad
}

/// Session lifecycle announcement relayed from a gateway to the session
/// manager (`action` is `started` or `ended`).
pub fn session_notice(sm: &str, gateway: &str, jid: &str, action: &str) -> Nad {
    let mut inner = Nad::with_root("session", Some(namespaces::COMPONENT));
    let root = inner.root().expect("just appended");
    inner.append_attr(root, "action", action);
    inner.append_attr(root, "jid", jid);
    wrap_route(sm, gateway, RouteType::Session, Some((&inner, root)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::stanza::Stanza;

    #[test]
    fn wrap_and_parse_round_trip() {
        let mut inner = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let inner_root = inner.root().unwrap();
        inner.append_attr(inner_root, "to", "bob@remote.example");

        let route = wrap_route(
            "remote.example",
            "c2s.example.net",
            RouteType::Unicast,
            Some((&inner, inner_root)),
        );
        let view = RouteView::parse(&route).unwrap();
        assert_eq!(view.to.as_deref(), Some("remote.example"));
        assert_eq!(view.from.as_deref(), Some("c2s.example.net"));
        assert_eq!(view.route_type, RouteType::Unicast);

        let payload = view.payload.unwrap();
        assert_eq!(route.name(payload), "message");
        let stanza = Stanza::new(route.clone());
        assert_eq!(stanza.kind(), crate::xmpp::stanza::StanzaKind::Other);
    }

    #[test]
    fn bind_request_carries_the_name() {
        let nad = bind_request("s2s.example.net");
        let root = nad.root().unwrap();
        assert_eq!(nad.name(root), "bind");
        assert_eq!(nad.attr_val(root, "name"), Some("s2s.example.net"));
    }

    #[test]
    fn non_route_elements_do_not_parse() {
        let nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        assert!(RouteView::parse(&nad).is_none());
    }

    #[test]
    fn session_notice_is_a_session_route() {
        let nad = session_notice("sm.example.net", "c2s.example.net", "a@example.net/x", "started");
        let view = RouteView::parse(&nad).unwrap();
        assert_eq!(view.route_type, RouteType::Session);
        let payload = view.payload.unwrap();
        assert_eq!(nad.attr_val(payload, "action"), Some("started"));
    }
}
