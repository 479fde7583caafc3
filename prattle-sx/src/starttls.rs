use anyhow::{bail, Error};

use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};

use crate::connection::Connection;
use crate::stream::XmppStream;

pub struct StarttlsNegotiator {
    _private: (),
}

impl StarttlsNegotiator {
    /// Feature child advertised while the stream is still plaintext.
    pub fn advertise_feature(required: bool) -> Nad {
        let mut nad = Nad::with_root("starttls", Some(namespaces::XMPP_STARTTLS));
        let root = nad.root().expect("just appended");
        if required {
            nad.append_elem(Some(root), "required", Some(namespaces::XMPP_STARTTLS));
        }
        nad
    }

    /// Server side: answer `<starttls/>` with `<proceed/>`, then run the
    /// handshake and reset the stream. The `<proceed/>` write completes
    /// before the upgrade starts, so the peer sees it in plaintext.
    pub async fn negotiate_feature<C: Connection>(
        stream: &mut XmppStream<C>,
        element: &Nad,
    ) -> Result<(), Error> {
        let root = element.root().expect("parsed elements have a root");
        if element.name(root) != "starttls"
            || element.ns_uri(root) != Some(namespaces::XMPP_STARTTLS)
        {
            bail!("expected starttls element");
        }

        let proceed = Nad::with_root("proceed", Some(namespaces::XMPP_STARTTLS));
        stream.write_nad(&proceed).await?;

        if let Err(error) = stream.upgrade_tls().await {
            let failure = Nad::with_root("failure", Some(namespaces::XMPP_STARTTLS));
            let _ = stream.write_nad(&failure).await;
            let _ = stream.close().await;
            return Err(error);
        }

        Ok(())
    }

    /// Client side: request STARTTLS, wait for `<proceed/>`, upgrade.
    pub async fn request<C: Connection>(stream: &mut XmppStream<C>) -> Result<(), Error> {
        let request = Nad::with_root("starttls", Some(namespaces::XMPP_STARTTLS));
        stream.write_nad(&request).await?;

        match stream.read_frame().await? {
            Some(Frame::Element(nad)) => {
                let root = nad.root().expect("parsed elements have a root");
                if nad.name(root) != "proceed" {
                    bail!("peer refused STARTTLS");
                }
            }
            _ => bail!("stream ended during STARTTLS"),
        }

        stream.upgrade_tls().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_feature_can_demand_tls() {
        let optional = StarttlsNegotiator::advertise_feature(false);
        assert_eq!(
            optional.serialize(),
            "<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>"
        );

        let required = StarttlsNegotiator::advertise_feature(true);
        let root = required.root().unwrap();
        assert!(required
            .find_child(root, "required", Some(namespaces::XMPP_STARTTLS))
            .is_some());
    }
}
