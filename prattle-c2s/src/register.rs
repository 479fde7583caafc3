use anyhow::Error;

use prattle_backend::StoreHandle;
use prattle_core::xml::{namespaces, Nad};
use prattle_core::xmpp::error::StanzaErrorCondition;
use prattle_core::xmpp::jid::Jid;
use prattle_core::xmpp::stanza::Stanza;
use prattle_sx::connection::Connection;
use prattle_sx::stream::XmppStream;

/// Whether this element is a `jabber:iq:register` request.
pub fn is_register_iq(nad: &Nad) -> bool {
    let Some(root) = nad.root() else { return false };
    nad.name(root) == "iq"
        && nad
            .find_child(root, "query", Some(namespaces::IQ_REGISTER))
            .is_some()
}

/// Pre-authentication registration: `get` returns the field form, `set`
/// with username and password creates the account.
pub async fn handle_preauth<C: Connection>(
    stream: &mut XmppStream<C>,
    element: &Nad,
    store: &StoreHandle,
    realm: &str,
) -> Result<(), Error> {
    let root = element.root().expect("parsed elements have a root");
    let id = element.attr_val(root, "id").unwrap_or("").to_string();

    match element.attr_val(root, "type") {
        Some("get") => {
            let mut reply = iq_result(&id);
            let reply_root = reply.root().expect("just appended");
            let query = reply.append_elem(Some(reply_root), "query", Some(namespaces::IQ_REGISTER));
            reply.append_elem(Some(query), "instructions", Some(namespaces::IQ_REGISTER));
            reply.append_elem(Some(query), "username", Some(namespaces::IQ_REGISTER));
            reply.append_elem(Some(query), "password", Some(namespaces::IQ_REGISTER));
            stream.write_nad(&reply).await
        }
        Some("set") => {
            let query = element
                .find_child(root, "query", Some(namespaces::IQ_REGISTER))
                .expect("checked by is_register_iq");
            let username = element
                .find_child(query, "username", Some(namespaces::IQ_REGISTER))
                .map(|c| element.text(c));
            let password = element
                .find_child(query, "password", Some(namespaces::IQ_REGISTER))
                .map(|c| element.text(c));

            let (Some(username), Some(password)) = (username, password) else {
                return error_reply(stream, element, StanzaErrorCondition::BadRequest).await;
            };
            if username.is_empty() || password.is_empty() {
                return error_reply(stream, element, StanzaErrorCondition::NotAcceptable).await;
            }

            match store.create_user(&username, realm, &password).await {
                Ok(()) => stream.write_nad(&iq_result(&id)).await,
                Err(_) => error_reply(stream, element, StanzaErrorCondition::NotAcceptable).await,
            }
        }
        _ => error_reply(stream, element, StanzaErrorCondition::BadRequest).await,
    }
}

/// Post-authentication registration traffic: password change and account
/// removal. Returns `true` when the session must close (account removed).
pub async fn handle_session<C: Connection>(
    stream: &mut XmppStream<C>,
    element: &Nad,
    store: &StoreHandle,
    realm: &str,
    jid: &Jid,
) -> Result<bool, Error> {
    let root = element.root().expect("parsed elements have a root");
    let id = element.attr_val(root, "id").unwrap_or("").to_string();
    let Some(query) = element.find_child(root, "query", Some(namespaces::IQ_REGISTER)) else {
        return Ok(false);
    };
    let Some(node) = jid.node() else {
        error_reply(stream, element, StanzaErrorCondition::Forbidden).await?;
        return Ok(false);
    };

    if element
        .find_child(query, "remove", Some(namespaces::IQ_REGISTER))
        .is_some()
    {
        store.delete_user(node, realm).await?;
        stream.write_nad(&iq_result(&id)).await?;
        return Ok(true);
    }

    let password = element
        .find_child(query, "password", Some(namespaces::IQ_REGISTER))
        .map(|c| element.text(c));
    match password {
        Some(password) if !password.is_empty() => {
            store.set_password(node, realm, &password).await?;
            stream.write_nad(&iq_result(&id)).await?;
        }
        _ => error_reply(stream, element, StanzaErrorCondition::BadRequest).await?,
    }
    Ok(false)
}

fn iq_result(id: &str) -> Nad {
    let mut nad = Nad::with_root("iq", Some(namespaces::XMPP_CLIENT));
    let root = nad.root().expect("just appended");
    if !id.is_empty() {
        nad.append_attr(root, "id", id);
    }
    nad.append_attr(root, "type", "result");
    nad
}

async fn error_reply<C: Connection>(
    stream: &mut XmppStream<C>,
    element: &Nad,
    condition: StanzaErrorCondition,
) -> Result<(), Error> {
    if let Some(reply) = Stanza::new(element.clone()).error_reply(condition) {
        stream.write_nad(&reply.nad).await?;
    }
    Ok(())
}
