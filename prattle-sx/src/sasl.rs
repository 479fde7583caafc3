use std::fmt::Display;
use std::future::Future;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Error};
use base64::prelude::*;
use rsasl::config::SASLConfig;
use rsasl::mechanisms::anonymous::ANONYMOUS;
use rsasl::mechanisms::plain::PLAIN;
use rsasl::prelude::Mechname;
use rsasl::registry::{Mechanism as MechanismEntry, Registry};
use thiserror::Error as ThisError;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::debug;

use prattle_core::xml::stream_parser::Frame;
use prattle_core::xml::{namespaces, Nad};

use crate::connection::Connection;
use crate::stream::XmppStream;

use self::common::{AuthError, BridgeCallback, MechanismNegotiatorResult};

pub mod common;
pub mod digest_md5;

/// The RFC 3920 SASL failure conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum SaslFailure {
    #[error("authentication aborted")]
    Aborted,
    #[error("response was not valid base64 or malformed")]
    IncorrectEncoding,
    #[error("requested authorization identity was refused")]
    InvalidAuthzid,
    #[error("mechanism is not offered")]
    InvalidMechanism,
    #[error("mechanism is too weak for this stream")]
    MechanismTooWeak,
    #[error("credentials were wrong")]
    NotAuthorized,
    #[error("authentication backend unavailable")]
    TemporaryAuthFailure,
}

impl SaslFailure {
    pub fn name(self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MechanismTooWeak => "mechanism-too-weak",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    Plain,
    DigestMd5,
    Anonymous,
}

impl Mechanism {
    pub const ALL: [Mechanism; 3] = [Mechanism::DigestMd5, Mechanism::Plain, Mechanism::Anonymous];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::DigestMd5 => "DIGEST-MD5",
            Self::Anonymous => "ANONYMOUS",
        }
    }

    /// Whether the server opens the exchange with a challenge.
    pub fn server_first(self) -> bool {
        matches!(self, Self::DigestMd5)
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Mechanism {
    type Error = SaslFailure;

    fn try_from(value: &str) -> Result<Self, SaslFailure> {
        match value {
            "PLAIN" => Ok(Self::Plain),
            "DIGEST-MD5" => Ok(Self::DigestMd5),
            "ANONYMOUS" => Ok(Self::Anonymous),
            _ => Err(SaslFailure::InvalidMechanism),
        }
    }
}

/// One request from the SASL engine to the application. The engine never
/// touches credential storage itself; everything goes through this seam.
#[derive(Debug)]
pub enum AuthRequest {
    /// Which realm governs this stream (derived from its `to` attribute,
    /// possibly remapped for shared virtual hosts).
    Realm { stream_to: Option<String> },
    /// The stored password, required by DIGEST-MD5. `None` means the
    /// backend cannot reveal passwords and the mechanism must not be
    /// offered.
    Password { user: String, realm: String },
    /// Verify a candidate password. Matching credentials answer `Ok`.
    CheckPassword {
        user: String,
        realm: String,
        candidate: String,
    },
    /// Whether the requested authorization identity may be assumed.
    CheckAuthzid { authzid: String },
    /// Mint an opaque identity for an anonymous login.
    GenAuthzid,
    /// Whether `mechanism` may be offered on a stream at this security
    /// strength.
    CheckMechanism { mechanism: Mechanism, ssf: u32 },
}

#[derive(Debug)]
pub enum AuthResponse {
    Realm(String),
    Password(Option<String>),
    Authzid(String),
    Ok,
    Fail,
}

pub trait SaslCallback: Send + Sync {
    fn handle(&self, request: AuthRequest) -> impl Future<Output = AuthResponse> + Send;
}

/// The mechanism set every server session selects from: rsasl's own PLAIN
/// and ANONYMOUS plus our DIGEST-MD5.
fn mechanism_registry() -> Registry {
    static MECHANISMS: OnceLock<Vec<MechanismEntry>> = OnceLock::new();
    let mechanisms = MECHANISMS.get_or_init(|| vec![PLAIN, ANONYMOUS, digest_md5::DIGEST_MD5]);
    Registry::with_mechanisms(mechanisms)
}

pub struct SaslNegotiator {
    _private: (),
}

impl SaslNegotiator {
    /// `<mechanisms/>` feature child listing what the application callback
    /// admits at the stream's current security strength.
    pub async fn advertise_feature<CB: SaslCallback>(callback: &CB, ssf: u32) -> Option<Nad> {
        let mut nad = Nad::with_root("mechanisms", Some(namespaces::XMPP_SASL));
        let root = nad.root().expect("just appended");
        let mut offered = false;
        for mechanism in Mechanism::ALL {
            let response = callback
                .handle(AuthRequest::CheckMechanism { mechanism, ssf })
                .await;
            if matches!(response, AuthResponse::Ok) {
                let child = nad.append_elem(Some(root), "mechanism", Some(namespaces::XMPP_SASL));
                nad.append_text(child, mechanism.as_str());
                offered = true;
            }
        }
        offered.then_some(nad)
    }

    /// Server side of one `<auth/>` exchange.
    ///
    /// The XML framing stays here; the challenge/response engine is an
    /// rsasl server session running under `spawn_blocking`, with credential
    /// questions relayed to `callback` while it runs.
    ///
    /// `Ok(Some(identity))` is an authenticated bare JID string; the caller
    /// records it and resets the stream once `<success/>` is flushed.
    /// `Ok(None)` means a failure element went out and the peer may retry.
    pub async fn negotiate_feature<C, CB>(
        stream: &mut XmppStream<C>,
        element: &Nad,
        callback: &CB,
    ) -> Result<Option<String>, Error>
    where
        C: Connection,
        CB: SaslCallback,
    {
        let root = element.root().expect("parsed elements have a root");
        if element.name(root) != "auth" || element.ns_uri(root) != Some(namespaces::XMPP_SASL) {
            bail!("expected auth element");
        }

        let mechanism = match element
            .attr_val(root, "mechanism")
            .ok_or(SaslFailure::InvalidMechanism)
            .and_then(Mechanism::try_from)
        {
            Ok(mechanism) => mechanism,
            Err(failure) => return Self::fail(stream, failure).await,
        };

        let admitted = callback
            .handle(AuthRequest::CheckMechanism {
                mechanism,
                ssf: stream.ssf(),
            })
            .await;
        if !matches!(admitted, AuthResponse::Ok) {
            return Self::fail(stream, SaslFailure::InvalidMechanism).await;
        }

        let stream_to = stream
            .peer_header()
            .and_then(|h| h.to.as_ref())
            .map(|jid| jid.domain().to_string());
        let realm = match callback
            .handle(AuthRequest::Realm {
                stream_to: stream_to.clone(),
            })
            .await
        {
            AuthResponse::Realm(realm) => realm,
            _ => stream_to.clone().unwrap_or_default(),
        };
        let domain = stream_to.unwrap_or_else(|| realm.clone());

        let initial = match decode_payload(&element.text(root)) {
            Ok(payload) => payload,
            Err(failure) => return Self::fail(stream, failure).await,
        };

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(16);
        let (output_tx, mut output_rx) = mpsc::channel::<MechanismNegotiatorResult>(16);
        let (request_tx, mut request_rx) = mpsc::channel(16);

        let config = SASLConfig::builder()
            .with_registry(mechanism_registry())
            .with_callback(BridgeCallback::new(realm.clone(), domain.clone(), request_tx))
            .map_err(|e| anyhow!("SASL configuration failed: {e}"))?;
        let mechname: &'static Mechname = mechanism
            .as_str()
            .try_into()
            .map_err(|e| anyhow!("bad mechanism name: {e}"))?;
        let mut authenticator =
            spawn_blocking(move || common::authenticate(config, mechname, input_rx, output_tx));

        if !mechanism.server_first() {
            let first = if initial.is_empty() {
                // no initial response; ask for one with an empty challenge
                Self::write_challenge(stream, &[]).await?;
                match Self::read_response(stream).await? {
                    Ok(payload) => payload,
                    Err(failure) => {
                        authenticator.abort();
                        return Self::fail(stream, failure).await;
                    }
                }
            } else {
                initial
            };
            let _ = input_tx.send(first).await;
        }

        loop {
            select! {
                output = output_rx.recv() => match output {
                    Some(MechanismNegotiatorResult::Challenge(data)) => {
                        Self::write_challenge(stream, &data).await?;
                        match Self::read_response(stream).await? {
                            Ok(payload) => {
                                let _ = input_tx.send(payload).await;
                            }
                            Err(failure) => {
                                authenticator.abort();
                                return Self::fail(stream, failure).await;
                            }
                        }
                    }
                    Some(MechanismNegotiatorResult::Success(additional_data)) => {
                        let validation = match (&mut authenticator).await {
                            Ok(Ok(validation)) => validation,
                            Ok(Err(error)) => {
                                debug!(%error, "authentication backend failed");
                                return Self::fail(stream, SaslFailure::TemporaryAuthFailure)
                                    .await;
                            }
                            Err(join_error) => {
                                return Err(anyhow!("authenticator went away: {join_error}"));
                            }
                        };
                        return match validation {
                            Ok(identity) => {
                                let mut success =
                                    Nad::with_root("success", Some(namespaces::XMPP_SASL));
                                if let Some(data) = additional_data {
                                    let success_root =
                                        success.root().expect("just appended");
                                    success
                                        .append_text(success_root, &BASE64_STANDARD.encode(data));
                                }
                                stream.write_nad(&success).await?;
                                Ok(Some(identity))
                            }
                            Err(AuthError::AuthzBad) => {
                                Self::fail(stream, SaslFailure::InvalidAuthzid).await
                            }
                            Err(_) => Self::fail(stream, SaslFailure::NotAuthorized).await,
                        };
                    }
                    Some(MechanismNegotiatorResult::Failure(error)) => {
                        debug!(%error, "mechanism refused the exchange");
                        return Self::fail(stream, SaslFailure::NotAuthorized).await;
                    }
                    None => {
                        // the engine never started (unknown or unusable
                        // mechanism)
                        let _ = (&mut authenticator).await;
                        return Self::fail(stream, SaslFailure::InvalidMechanism).await;
                    }
                },
                Some((request, response_tx)) = request_rx.recv() => {
                    let response = callback.handle(request).await;
                    let _ = response_tx.send(response);
                }
            }
        }
    }

    async fn write_challenge<C: Connection>(
        stream: &mut XmppStream<C>,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut challenge = Nad::with_root("challenge", Some(namespaces::XMPP_SASL));
        let root = challenge.root().expect("just appended");
        if data.is_empty() {
            challenge.append_text(root, "=");
        } else {
            challenge.append_text(root, &BASE64_STANDARD.encode(data));
        }
        stream.write_nad(&challenge).await?;
        Ok(())
    }

    /// Reads the next `<response/>`, reporting `<abort/>` and junk as
    /// failures.
    async fn read_response<C: Connection>(
        stream: &mut XmppStream<C>,
    ) -> Result<Result<Vec<u8>, SaslFailure>, Error> {
        let frame = stream.read_frame().await?;
        let Some(Frame::Element(element)) = frame else {
            bail!("stream ended during SASL exchange");
        };
        let root = element.root().expect("parsed elements have a root");
        if element.ns_uri(root) != Some(namespaces::XMPP_SASL) {
            bail!("unexpected element during SASL exchange");
        }
        match element.name(root) {
            "response" => Ok(decode_payload(&element.text(root))),
            "abort" => Ok(Err(SaslFailure::Aborted)),
            _ => bail!("unexpected element during SASL exchange"),
        }
    }

    async fn fail<C: Connection>(
        stream: &mut XmppStream<C>,
        failure: SaslFailure,
    ) -> Result<Option<String>, Error> {
        let mut nad = Nad::with_root("failure", Some(namespaces::XMPP_SASL));
        let root = nad.root().expect("just appended");
        nad.append_elem(Some(root), failure.name(), Some(namespaces::XMPP_SASL));
        stream.write_nad(&nad).await?;
        Ok(None)
    }
}

/// SASL payloads use `=` for an explicit empty response.
fn decode_payload(text: &str) -> Result<Vec<u8>, SaslFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(trimmed)
        .map_err(|_| SaslFailure::IncorrectEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCallback;

    impl SaslCallback for StaticCallback {
        async fn handle(&self, request: AuthRequest) -> AuthResponse {
            match request {
                AuthRequest::CheckMechanism { mechanism, ssf } => match mechanism {
                    Mechanism::Plain if ssf > 0 => AuthResponse::Ok,
                    Mechanism::DigestMd5 => AuthResponse::Ok,
                    _ => AuthResponse::Fail,
                },
                _ => AuthResponse::Fail,
            }
        }
    }

    #[tokio::test]
    async fn plaintext_stream_hides_plain() {
        let nad = SaslNegotiator::advertise_feature(&StaticCallback, 0)
            .await
            .unwrap();
        let root = nad.root().unwrap();
        let listed: Vec<String> = nad.children(root).map(|c| nad.text(c)).collect();
        assert_eq!(listed, vec!["DIGEST-MD5".to_string()]);
    }

    #[tokio::test]
    async fn encrypted_stream_offers_plain() {
        let nad = SaslNegotiator::advertise_feature(&StaticCallback, 128)
            .await
            .unwrap();
        let root = nad.root().unwrap();
        let listed: Vec<String> = nad.children(root).map(|c| nad.text(c)).collect();
        assert!(listed.contains(&"PLAIN".to_string()));
    }

    #[test]
    fn registry_carries_the_offered_mechanisms() {
        // building the registry proves the custom DIGEST-MD5 entry links
        // in next to rsasl's own mechanisms
        let _registry = mechanism_registry();
        assert!(Mechanism::DigestMd5.server_first());
        assert!(!Mechanism::Plain.server_first());
    }

    #[test]
    fn empty_payload_conventions() {
        assert_eq!(decode_payload("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_payload("=").unwrap(), Vec::<u8>::new());
        assert!(decode_payload("!!!").is_err());
    }
}
