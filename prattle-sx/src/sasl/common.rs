use std::io::Cursor;
use std::sync::Arc;

use anyhow::{anyhow, Error};
use rsasl::callback::SessionCallback;
use rsasl::config::SASLConfig;
use rsasl::prelude::{Mechname, MessageSent, SASLServer, State, Validation};
use rsasl::property::{AuthId, AuthzId, Password, Realm};
use tokio::sync::{mpsc, oneshot};

use super::{AuthRequest, AuthResponse};

/// Application-level outcome of a finished exchange, carried through the
/// rsasl validation hook.
#[derive(Debug)]
pub enum AuthError {
    AuthzBad,
    PasswordIncorrect,
    NoSuchUser,
}

pub struct SaslValidation;

impl Validation for SaslValidation {
    type Value = Result<String, AuthError>;
}

/// One step's worth of output from the mechanism engine.
pub enum MechanismNegotiatorResult {
    Challenge(Vec<u8>),
    Success(Option<Vec<u8>>),
    Failure(Error),
}

/// Runs the blocking rsasl server session: inputs arrive over `input_rx`,
/// every challenge/finish is reported over `output_tx`, and the validation
/// outcome is the return value. Runs under `spawn_blocking`; the async side
/// services credential requests concurrently.
pub fn authenticate(
    config: Arc<SASLConfig>,
    mechname: &Mechname,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<MechanismNegotiatorResult>,
) -> Result<Result<String, AuthError>, Error> {
    let server = SASLServer::<SaslValidation>::new(config);

    let mut server_session = server.start_suggested(mechname)?;

    while {
        let mut server_out = Cursor::new(Vec::new());
        let state = if server_session.are_we_first() {
            server_session.step(None, &mut server_out)
        } else {
            let input = input_rx
                .blocking_recv()
                .ok_or(anyhow!("SASL exchange aborted"))?;
            server_session.step(Some(input.as_slice()), &mut server_out)
        };
        let running = state.as_ref().is_ok_and(|s| s.is_running());

        let output = match state {
            Ok(State::Running) => MechanismNegotiatorResult::Challenge(server_out.into_inner()),
            Ok(State::Finished(message_sent)) => {
                let additional_data = match message_sent {
                    MessageSent::Yes => Some(server_out.into_inner()),
                    MessageSent::No => None,
                };
                MechanismNegotiatorResult::Success(additional_data)
            }
            Err(err) => MechanismNegotiatorResult::Failure(anyhow!(err)),
        };

        output_tx
            .blocking_send(output)
            .map_err(|_| anyhow!("Failed to send SASL output"))?;

        running
    } {}

    server_session
        .validation()
        .ok_or_else(|| anyhow!("Could not complete authentication"))
}

/// The [`SessionCallback`] wired into every server session. Mechanisms pull
/// credentials and the realm through `callback`; `validate` settles the
/// authenticated identity. Both run on the blocking authenticator thread,
/// so every application question crosses back over a channel.
pub struct BridgeCallback {
    realm: String,
    domain: String,
    requests: mpsc::Sender<(AuthRequest, oneshot::Sender<AuthResponse>)>,
}

impl BridgeCallback {
    pub fn new(
        realm: String,
        domain: String,
        requests: mpsc::Sender<(AuthRequest, oneshot::Sender<AuthResponse>)>,
    ) -> Self {
        Self {
            realm,
            domain,
            requests,
        }
    }

    fn ask(&self, request: AuthRequest) -> Result<AuthResponse, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .blocking_send((request, response_tx))
            .map_err(|_| anyhow!("Could not reach the authentication callback"))?;
        response_rx
            .blocking_recv()
            .map_err(|_| anyhow!("Could not reach the authentication callback"))
    }
}

impl SessionCallback for BridgeCallback {
    fn callback(
        &self,
        _session_data: &rsasl::callback::SessionData,
        context: &rsasl::callback::Context,
        request: &mut rsasl::callback::Request,
    ) -> Result<(), rsasl::prelude::SessionError> {
        request.satisfy::<Realm>(self.realm.as_str())?;

        if let Some(authid) = context.get_ref::<AuthId>() {
            if let Ok(AuthResponse::Password(Some(password))) = self.ask(AuthRequest::Password {
                user: authid.to_string(),
                realm: self.realm.clone(),
            }) {
                request.satisfy::<Password>(password.as_bytes())?;
            }
        }
        Ok(())
    }

    fn validate(
        &self,
        _session_data: &rsasl::callback::SessionData,
        context: &rsasl::callback::Context,
        validate: &mut rsasl::validate::Validate<'_>,
    ) -> Result<(), rsasl::validate::ValidationError> {
        validate.with::<SaslValidation, _>(|| {
            let authid = context.get_ref::<AuthId>().map(str::to_string);
            let authzid = context
                .get_ref::<AuthzId>()
                .filter(|z| !z.is_empty())
                .map(str::to_string);
            let password = context.get_ref::<Password>();

            let identity = match (&authid, password) {
                // the mechanism handed us the candidate (PLAIN)
                (Some(user), Some(candidate)) => {
                    let candidate = String::from_utf8_lossy(candidate).into_owned();
                    match self.ask(AuthRequest::CheckPassword {
                        user: user.clone(),
                        realm: self.realm.clone(),
                        candidate,
                    }) {
                        Ok(AuthResponse::Ok) => format!("{}@{}", user, self.domain),
                        _ => return Ok(Err(AuthError::PasswordIncorrect)),
                    }
                }
                // the mechanism verified the credentials itself
                (Some(user), None) => format!("{}@{}", user, self.domain),
                // no identity claimed at all: anonymous login
                (None, _) => match self.ask(AuthRequest::GenAuthzid) {
                    Ok(AuthResponse::Authzid(node)) => format!("{}@{}", node, self.domain),
                    _ => return Ok(Err(AuthError::NoSuchUser)),
                },
            };

            if let Some(authzid) = authzid {
                return match self.ask(AuthRequest::CheckAuthzid {
                    authzid: authzid.clone(),
                }) {
                    Ok(AuthResponse::Ok) => Ok(Ok(authzid)),
                    _ => Ok(Err(AuthError::AuthzBad)),
                };
            }

            Ok(Ok(identity))
        })?;

        Ok(())
    }
}
