use crate::xml::{namespaces, Nad};
use crate::xmpp::error::StanzaErrorCondition;
use crate::xmpp::jid::Jid;

/// A top-level stream child (`<message/>`, `<presence/>`, `<iq/>`) plus the
/// accessors the routing layers keep reaching for.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub nad: Nad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    Other,
}

impl Stanza {
    pub fn new(nad: Nad) -> Self {
        Self { nad }
    }

    fn root(&self) -> Option<usize> {
        self.nad.root()
    }

    pub fn kind(&self) -> StanzaKind {
        match self.root().map(|r| self.nad.name(r)) {
            Some("message") => StanzaKind::Message,
            Some("presence") => StanzaKind::Presence,
            Some("iq") => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }

    pub fn to(&self) -> Option<Jid> {
        self.attr("to")
    }

    pub fn from(&self) -> Option<Jid> {
        self.attr("from")
    }

    pub fn id(&self) -> Option<String> {
        let root = self.root()?;
        self.nad.attr_val(root, "id").map(str::to_string)
    }

    pub fn stanza_type(&self) -> Option<String> {
        let root = self.root()?;
        self.nad.attr_val(root, "type").map(str::to_string)
    }

    fn attr(&self, name: &str) -> Option<Jid> {
        let root = self.root()?;
        self.nad.attr_val(root, name)?.parse().ok()
    }

    /// Builds the `type='error'` reply for this stanza: addresses swapped,
    /// original payload retained, condition appended. Stanzas that are
    /// themselves errors yield `None` so bounce loops die out.
    pub fn error_reply(&self, condition: StanzaErrorCondition) -> Option<Stanza> {
        if self.stanza_type().as_deref() == Some("error") {
            return None;
        }
        let root = self.root()?;

        let mut reply = self.nad.clone();
        let to = self.nad.attr_val(root, "from").map(str::to_string);
        let from = self.nad.attr_val(root, "to").map(str::to_string);
        match to {
            Some(to) => reply.set_attr(root, "to", &to),
            None => reply.set_attr(root, "to", ""),
        }
        match from {
            Some(from) => reply.set_attr(root, "from", &from),
            None => reply.set_attr(root, "from", ""),
        }
        reply.set_attr(root, "type", "error");

        let ns = self.nad.ns_uri(root);
        let error = reply.append_elem(Some(root), "error", ns);
        reply.append_attr(error, "type", condition.error_type());
        reply.append_elem(
            Some(error),
            condition.name(),
            Some(namespaces::XMPP_STANZA_ERRORS),
        );

        Some(Stanza::new(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, to: &str) -> Stanza {
        let mut nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "from", from);
        nad.append_attr(root, "to", to);
        let body = nad.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        nad.append_text(body, "hello");
        Stanza::new(nad)
    }

    #[test]
    fn kind_is_derived_from_the_root_name() {
        let stanza = message("a@x", "b@y");
        assert_eq!(stanza.kind(), StanzaKind::Message);
    }

    #[test]
    fn error_reply_swaps_addresses() {
        let stanza = message("alice@example.net", "bob@remote.example");
        let reply = stanza
            .error_reply(StanzaErrorCondition::RemoteServerTimeout)
            .unwrap();
        assert_eq!(reply.to().unwrap().to_string(), "alice@example.net");
        assert_eq!(reply.from().unwrap().to_string(), "bob@remote.example");
        assert_eq!(reply.stanza_type().as_deref(), Some("error"));

        let root = reply.nad.root().unwrap();
        let error = reply
            .nad
            .find_child(root, "error", Some(namespaces::XMPP_CLIENT))
            .unwrap();
        assert!(reply
            .nad
            .find_child(
                error,
                "remote-server-timeout",
                Some(namespaces::XMPP_STANZA_ERRORS)
            )
            .is_some());
    }

    #[test]
    fn error_stanzas_are_not_bounced_again() {
        let mut nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "type", "error");
        let stanza = Stanza::new(nad);
        assert!(stanza
            .error_reply(StanzaErrorCondition::ServiceUnavailable)
            .is_none());
    }
}
