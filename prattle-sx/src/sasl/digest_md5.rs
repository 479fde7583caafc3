use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::Write;

use md5::{Digest, Md5};
use rand::{RngCore, SeedableRng};
use rsasl::config::SASLConfig;
use rsasl::mechanism::{
    Authentication, Demand, DemandReply, MechanismData, MechanismError, MechanismErrorKind,
    Provider,
};
use rsasl::prelude::{Mechname, MessageSent, SASLError, SessionError, State};
use rsasl::property::{AuthId, AuthzId, Password, Realm};
use rsasl::registry::{Matches, Mechanism, Named, Side};

use super::SaslFailure;

/// Server half of RFC 2831 DIGEST-MD5 (md5-sess, qop=auth), registered as an
/// rsasl mechanism. rsasl carries no DIGEST-MD5 of its own, so the directive
/// handling and response computation live here; credentials and the realm
/// come from the session callback like any other mechanism, and the
/// validation hook settles the identity.
pub static DIGEST_MD5: Mechanism = Mechanism::build(
    Mechname::const_new_unchecked(b"DIGEST-MD5"),
    300,
    None,
    Some(DigestMd5::new_server),
    Side::Server,
    |_| Some(Matches::<Select>::name()),
    |_| true,
);

struct Select;

impl Named for Select {
    fn mech() -> &'static Mechanism {
        &DIGEST_MD5
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DigestMd5Error {
    MissingInput,
    BadDirectives,
    NonceMismatch,
    UnsupportedQop,
    InvalidResponse,
    NotUtf8,
}

impl Display for DigestMd5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInput => f.write_str("response expected but none arrived"),
            Self::BadDirectives => f.write_str("response directives are malformed"),
            Self::NonceMismatch => f.write_str("nonce does not match the challenge"),
            Self::UnsupportedQop => f.write_str("only qop=auth is supported"),
            Self::InvalidResponse => f.write_str("response digest does not match"),
            Self::NotUtf8 => f.write_str("response is not UTF-8"),
        }
    }
}

impl std::error::Error for DigestMd5Error {}

impl MechanismError for DigestMd5Error {
    fn kind(&self) -> MechanismErrorKind {
        match self {
            Self::MissingInput | Self::BadDirectives | Self::NotUtf8 => MechanismErrorKind::Parse,
            Self::UnsupportedQop => MechanismErrorKind::Protocol,
            Self::NonceMismatch | Self::InvalidResponse => MechanismErrorKind::Outcome,
        }
    }
}

enum DigestStep {
    Challenge,
    Response,
    Done,
}

struct DigestMd5 {
    step: DigestStep,
    realm: Option<String>,
    nonce: String,
}

impl DigestMd5 {
    fn new_server(_config: &SASLConfig) -> Result<Box<dyn Authentication>, SASLError> {
        Ok(Box::new(Self {
            step: DigestStep::Challenge,
            realm: None,
            nonce: generate_nonce(),
        }))
    }
}

/// Context for callback questions while handling one response: the claimed
/// user and, when present, the requested authorization identity.
struct DigestContext<'a> {
    authid: &'a str,
    authzid: Option<&'a str>,
}

impl<'a> Provider<'a> for DigestContext<'a> {
    fn provide(&self, req: &mut Demand<'a>) -> DemandReply<()> {
        req.provide_ref::<AuthId>(self.authid)?;
        if let Some(authzid) = self.authzid {
            req.provide_ref::<AuthzId>(authzid)?;
        }
        req.done()
    }
}

struct NoContext;

impl<'a> Provider<'a> for NoContext {
    fn provide(&self, req: &mut Demand<'a>) -> DemandReply<()> {
        req.done()
    }
}

impl Authentication for DigestMd5 {
    fn step(
        &mut self,
        session: &mut MechanismData,
        input: Option<&[u8]>,
        writer: &mut dyn Write,
    ) -> Result<State, SessionError> {
        match self.step {
            DigestStep::Challenge => {
                let realm = session
                    .need_with::<Realm, _, _>(&NoContext, |realm| Ok(realm.to_string()))
                    .unwrap_or_default();
                let challenge = format!(
                    "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    realm, self.nonce
                );
                writer.write_all(challenge.as_bytes())?;
                self.realm = Some(realm);
                self.step = DigestStep::Response;
                Ok(State::Running)
            }
            DigestStep::Response => {
                let input = input.ok_or(DigestMd5Error::MissingInput)?;
                let input = std::str::from_utf8(input).map_err(|_| DigestMd5Error::NotUtf8)?;
                let directives = parse_directives(input);
                let username = directives
                    .get("username")
                    .ok_or(DigestMd5Error::BadDirectives)?
                    .clone();
                let authzid = directives.get("authzid").filter(|a| !a.is_empty()).cloned();
                let realm = self.realm.clone().unwrap_or_default();
                let nonce = self.nonce.clone();

                let provider = DigestContext {
                    authid: &username,
                    authzid: authzid.as_deref(),
                };
                let rspauth = session.need_with::<Password, _, _>(&provider, |password| {
                    let password = std::str::from_utf8(password)
                        .map_err(|_| SessionError::from(DigestMd5Error::NotUtf8))?;
                    verify_response(&directives, &realm, &nonce, password)
                        .map_err(SessionError::from)
                })?;
                session.validate(&provider)?;

                writer.write_all(format!("rspauth={}", rspauth).as_bytes())?;
                self.step = DigestStep::Done;
                Ok(State::Finished(MessageSent::Yes))
            }
            DigestStep::Done => Err(DigestMd5Error::MissingInput.into()),
        }
    }
}

/// Checks the client's response directives against the stored password and
/// returns the `rspauth` value on success.
fn verify_response(
    directives: &HashMap<String, String>,
    realm: &str,
    nonce: &str,
    password: &str,
) -> Result<String, DigestMd5Error> {
    let username = directive(directives, "username")?;
    let client_nonce = directive(directives, "nonce")?;
    let cnonce = directive(directives, "cnonce")?;
    let response = directive(directives, "response")?;
    let digest_uri = directive(directives, "digest-uri")?;
    let nc = directives.get("nc").map(String::as_str).unwrap_or("00000001");
    let authzid = directives.get("authzid").map(String::as_str);

    if client_nonce != nonce {
        return Err(DigestMd5Error::NonceMismatch);
    }
    if let Some(claimed_realm) = directives.get("realm") {
        if claimed_realm != realm {
            return Err(DigestMd5Error::NonceMismatch);
        }
    }
    if let Some(qop) = directives.get("qop") {
        if qop != "auth" {
            return Err(DigestMd5Error::UnsupportedQop);
        }
    }

    let expected = compute_response(
        username, realm, password, nonce, cnonce, nc, digest_uri, authzid, true,
    );
    if expected != response {
        return Err(DigestMd5Error::InvalidResponse);
    }

    Ok(compute_response(
        username, realm, password, nonce, cnonce, nc, digest_uri, authzid, false,
    ))
}

/// Client half, used on the uplink to the router.
pub struct DigestMd5Client {
    user: String,
    password: String,
    digest_uri: String,
}

impl DigestMd5Client {
    pub fn new(user: &str, password: &str, digest_uri: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            digest_uri: digest_uri.to_string(),
        }
    }

    /// Answers a server challenge; returns the response string and the
    /// `rspauth` we expect back.
    pub fn respond(&self, challenge: &str) -> Result<(String, String), SaslFailure> {
        let directives = parse_directives(challenge);
        let realm = directives.get("realm").cloned().unwrap_or_default();
        let nonce = directives
            .get("nonce")
            .ok_or(SaslFailure::IncorrectEncoding)?;
        let cnonce = generate_nonce();
        let nc = "00000001";

        let response = compute_response(
            &self.user,
            &realm,
            &self.password,
            nonce,
            &cnonce,
            nc,
            &self.digest_uri,
            None,
            true,
        );
        let rspauth = compute_response(
            &self.user,
            &realm,
            &self.password,
            nonce,
            &cnonce,
            nc,
            &self.digest_uri,
            None,
            false,
        );

        let out = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,\
             digest-uri=\"{}\",response={},charset=utf-8",
            self.user, realm, nonce, cnonce, nc, self.digest_uri, response
        );
        Ok((out, rspauth))
    }
}

fn directive<'d>(
    directives: &'d HashMap<String, String>,
    name: &str,
) -> Result<&'d str, DigestMd5Error> {
    directives
        .get(name)
        .map(String::as_str)
        .ok_or(DigestMd5Error::BadDirectives)
}

/// Splits `key=value,key="value"` pairs, honouring quotes.
pub fn parse_directives(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].trim().to_string();
                    rest = rest[comma + 1..].trim_start();
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        out.insert(key, value);
    }
    out
}

/// The md5-sess computation shared by both halves. `client_to_server`
/// selects the `AUTHENTICATE:` A2 form; the other form yields `rspauth`.
#[allow(clippy::too_many_arguments)]
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    authzid: Option<&str>,
    client_to_server: bool,
) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password));
    let urp = hasher.finalize();

    let mut a1 = urp.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    if let Some(authzid) = authzid {
        a1.extend_from_slice(format!(":{}", authzid).as_bytes());
    }
    let ha1 = hex(&Md5::digest(&a1));

    let a2 = if client_to_server {
        format!("AUTHENTICATE:{}", digest_uri)
    } else {
        format!(":{}", digest_uri)
    };
    let ha2 = hex(&Md5::digest(a2.as_bytes()));

    let kd = format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2);
    hex(&Md5::digest(kd.as_bytes()))
}

fn generate_nonce() -> String {
    let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
    let mut raw = [0u8; 16];
    rng.fill_bytes(&mut raw);
    hex(&raw)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Worked example from RFC 2831 section 4.
    const USER: &str = "chris";
    const REALM: &str = "elwood.innosoft.com";
    const PASSWORD: &str = "secret";
    const NONCE: &str = "OA6MG9tEQGm2hh";
    const CNONCE: &str = "OA6MHXh6VqTrRk";
    const URI: &str = "imap/elwood.innosoft.com";

    #[test]
    fn rfc_2831_response_vector() {
        let response = compute_response(
            USER, REALM, PASSWORD, NONCE, CNONCE, "00000001", URI, None, true,
        );
        assert_eq!(response, "d388dad90d4bbd760a152321f2143af7");
    }

    #[test]
    fn rfc_2831_rspauth_vector() {
        let rspauth = compute_response(
            USER, REALM, PASSWORD, NONCE, CNONCE, "00000001", URI, None, false,
        );
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }

    #[test]
    fn matching_response_yields_rspauth() {
        let directives = parse_directives(&format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,\
             digest-uri=\"{}\",response=d388dad90d4bbd760a152321f2143af7",
            USER, REALM, NONCE, CNONCE, URI
        ));
        let rspauth = verify_response(&directives, REALM, NONCE, PASSWORD).unwrap();
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }

    #[test]
    fn wrong_password_guess_is_rejected() {
        let directives = parse_directives(&format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,\
             digest-uri=\"{}\",response=00000000000000000000000000000000",
            USER, REALM, NONCE, CNONCE, URI
        ));
        assert_eq!(
            verify_response(&directives, REALM, NONCE, PASSWORD),
            Err(DigestMd5Error::InvalidResponse)
        );
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let directives = parse_directives(&format!(
            "username=\"{}\",realm=\"{}\",nonce=\"stale\",cnonce=\"{}\",nc=00000001,qop=auth,\
             digest-uri=\"{}\",response=d388dad90d4bbd760a152321f2143af7",
            USER, REALM, CNONCE, URI
        ));
        assert_eq!(
            verify_response(&directives, REALM, "fresh-nonce", PASSWORD),
            Err(DigestMd5Error::NonceMismatch)
        );
    }

    #[test]
    fn client_and_server_agree() {
        let nonce = generate_nonce();
        let challenge = format!(
            "realm=\"router\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
            nonce
        );
        let client = DigestMd5Client::new("c2s-user", "c2s-secret", "xmpp/router");
        let (response, expected_rspauth) = client.respond(&challenge).unwrap();
        let directives = parse_directives(&response);
        let rspauth = verify_response(&directives, "router", &nonce, "c2s-secret").unwrap();
        assert_eq!(rspauth, expected_rspauth);
    }

    #[test]
    fn directive_parser_handles_quotes_and_bare_values() {
        let directives = parse_directives("realm=\"a,b\",nonce=\"n\",qop=auth,charset=utf-8");
        assert_eq!(directives.get("realm").unwrap(), "a,b");
        assert_eq!(directives.get("qop").unwrap(), "auth");
        assert_eq!(directives.get("charset").unwrap(), "utf-8");
    }
}
