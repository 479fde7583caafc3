use sha1::{Digest, Sha1};

use prattle_core::xml::{namespaces, Nad};

/// Dialback key: `SHA1(secret ‖ ' ' ‖ remote-domain ‖ ' ' ‖ stream-id)`,
/// lowercase hex. Both sides derive it independently, so it must be
/// deterministic down to the byte.
pub fn db_key(secret: &str, remote: &str, stream_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(secret.as_bytes());
    hasher.update(b" ");
    hasher.update(remote.as_bytes());
    hasher.update(b" ");
    hasher.update(stream_id.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// `local/remote`, the per-connection identifier of one directional domain
/// pair.
pub fn route_key(local: &str, remote: &str) -> String {
    format!("{}/{}", local, remote)
}

/// `<db:result from to>key</db:result>` asking the peer to validate us.
pub fn result_request(local: &str, remote: &str, key: &str) -> Nad {
    let mut nad = Nad::with_root("result", Some(namespaces::XMPP_DIALBACK));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "from", local);
    nad.append_attr(root, "to", remote);
    nad.append_text(root, key);
    nad
}

/// `<db:result type='valid|invalid'/>` answering a peer's request.
pub fn result_response(local: &str, remote: &str, valid: bool) -> Nad {
    let mut nad = Nad::with_root("result", Some(namespaces::XMPP_DIALBACK));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "from", local);
    nad.append_attr(root, "to", remote);
    nad.append_attr(root, "type", if valid { "valid" } else { "invalid" });
    nad
}

/// `<db:verify from to id>key</db:verify>` sent to the authoritative server.
pub fn verify_request(local: &str, remote: &str, stream_id: &str, key: &str) -> Nad {
    let mut nad = Nad::with_root("verify", Some(namespaces::XMPP_DIALBACK));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "from", local);
    nad.append_attr(root, "to", remote);
    nad.append_attr(root, "id", stream_id);
    nad.append_text(root, key);
    nad
}

/// `<db:verify type='valid|invalid'/>` answering a verify request; the id
/// must echo the asking stream's id.
pub fn verify_response(local: &str, remote: &str, stream_id: &str, valid: bool) -> Nad {
    let mut nad = Nad::with_root("verify", Some(namespaces::XMPP_DIALBACK));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "from", local);
    nad.append_attr(root, "to", remote);
    nad.append_attr(root, "id", stream_id);
    nad.append_attr(root, "type", if valid { "valid" } else { "invalid" });
    nad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = db_key("s3cr3t", "remote.example", "stream-1");
        let b = db_key("s3cr3t", "remote.example", "stream-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn key_varies_with_every_input() {
        let base = db_key("s3cr3t", "remote.example", "stream-1");
        assert_ne!(base, db_key("other", "remote.example", "stream-1"));
        assert_ne!(base, db_key("s3cr3t", "other.example", "stream-1"));
        assert_ne!(base, db_key("s3cr3t", "remote.example", "stream-2"));
    }

    #[test]
    fn verify_response_echoes_the_stream_id() {
        let nad = verify_response("local.example", "remote.example", "abc", true);
        let root = nad.root().unwrap();
        assert_eq!(nad.attr_val(root, "id"), Some("abc"));
        assert_eq!(nad.attr_val(root, "type"), Some("valid"));
        assert_eq!(nad.ns_uri(root), Some(namespaces::XMPP_DIALBACK));
    }

    #[test]
    fn result_request_carries_the_key() {
        let key = db_key("s3cr3t", "remote.example", "stream-1");
        let nad = result_request("local.example", "remote.example", &key);
        let root = nad.root().unwrap();
        assert_eq!(nad.text(root), key);
        assert_eq!(nad.attr_val(root, "from"), Some("local.example"));
        assert_eq!(nad.attr_val(root, "to"), Some("remote.example"));
    }
}
