use std::collections::HashMap;

use rand::{RngCore, SeedableRng};
use tracing::debug;

use prattle_backend::StoreHandle;
use prattle_core::xmpp::jid::{prep_domain, Jid};
use prattle_sx::sasl::{AuthRequest, AuthResponse, Mechanism, SaslCallback};

use crate::settings::{MechanismSettings, Settings};

/// SASL mediation for client streams: mechanism policy from configuration,
/// credentials from the auth provider, realms from the virtual-host map.
pub struct C2sAuth {
    store: StoreHandle,
    mechanisms: MechanismSettings,
    realms: HashMap<String, String>,
}

impl C2sAuth {
    pub fn new(settings: &Settings, store: StoreHandle) -> Self {
        let realms = settings
            .realm_map()
            .into_iter()
            .filter_map(|(domain, realm)| {
                let domain = prep_domain(&domain).ok()?;
                Some((domain, realm))
            })
            .collect();
        Self {
            store,
            mechanisms: settings.authreg.mechanisms.clone(),
            realms,
        }
    }

    fn realm_of(&self, stream_to: Option<&str>) -> String {
        let Some(raw) = stream_to else {
            return String::new();
        };
        let domain = prep_domain(raw).unwrap_or_else(|_| raw.to_string());
        self.realms.get(&domain).cloned().unwrap_or(domain)
    }
}

impl SaslCallback for C2sAuth {
    async fn handle(&self, request: AuthRequest) -> AuthResponse {
        match request {
            AuthRequest::CheckMechanism { mechanism, ssf } => {
                let offer = match mechanism {
                    // plaintext password on a plaintext socket is never ok
                    Mechanism::Plain => self.mechanisms.plain && ssf > 0,
                    Mechanism::DigestMd5 => {
                        self.mechanisms.digest_md5 && self.store.supports_get_password()
                    }
                    Mechanism::Anonymous => self.mechanisms.anonymous,
                };
                if offer {
                    AuthResponse::Ok
                } else {
                    AuthResponse::Fail
                }
            }
            AuthRequest::Realm { stream_to } => {
                AuthResponse::Realm(self.realm_of(stream_to.as_deref()))
            }
            AuthRequest::Password { user, realm } => match self.store.get_password(&user, &realm).await
            {
                Ok(password) => AuthResponse::Password(password),
                Err(error) => {
                    debug!(%error, "password lookup failed");
                    AuthResponse::Password(None)
                }
            },
            AuthRequest::CheckPassword {
                user,
                realm,
                candidate,
            } => match self.store.check_password(&user, &realm, &candidate).await {
                Ok(true) => AuthResponse::Ok,
                _ => AuthResponse::Fail,
            },
            AuthRequest::CheckAuthzid { authzid } => {
                let Ok(jid) = authzid.parse::<Jid>() else {
                    return AuthResponse::Fail;
                };
                if !jid.is_bare() || jid.node().is_none() {
                    return AuthResponse::Fail;
                }
                let Some(realm) = self.realms.get(jid.domain()).cloned() else {
                    return AuthResponse::Fail;
                };
                let node = jid.node().expect("checked above");
                match self.store.user_exists(node, &realm).await {
                    Ok(true) => AuthResponse::Ok,
                    _ => AuthResponse::Fail,
                }
            }
            AuthRequest::GenAuthzid => {
                let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
                let mut raw = [0u8; 8];
                rng.fill_bytes(&mut raw);
                let node: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
                AuthResponse::Authzid(format!("anon-{}", node))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{IdEntry, LocalSettings, RetrySettings, RouterSettings};
    use prattle_backend::MemoryAuthBackend;

    fn settings() -> Settings {
        Settings {
            id: "c2s.example.net".to_string(),
            sm: "sm.example.net".to_string(),
            router: RouterSettings {
                ip: "127.0.0.1".to_string(),
                port: 5347,
                user: "c2s-user".to_string(),
                pass: "c2s-secret".to_string(),
                use_tls: false,
                retry: RetrySettings::default(),
            },
            local: LocalSettings {
                ip: "127.0.0.1".to_string(),
                port: 5222,
                ssl_port: None,
                pemfile: None,
                require_starttls: false,
                ids: vec![
                    IdEntry {
                        name: "example.net".to_string(),
                        realm: None,
                    },
                    IdEntry {
                        name: "vhost.example.net".to_string(),
                        realm: Some("example.net".to_string()),
                    },
                ],
            },
            io: Default::default(),
            authreg: Default::default(),
            pidfile: None,
        }
    }

    fn auth() -> C2sAuth {
        let store = StoreHandle::new(MemoryAuthBackend::with_user(
            "alice",
            "example.net",
            "sekrit",
        ));
        C2sAuth::new(&settings(), store)
    }

    #[tokio::test]
    async fn plain_is_gated_on_tls() {
        let auth = auth();
        let plaintext = auth
            .handle(AuthRequest::CheckMechanism {
                mechanism: Mechanism::Plain,
                ssf: 0,
            })
            .await;
        assert!(matches!(plaintext, AuthResponse::Fail));
        let encrypted = auth
            .handle(AuthRequest::CheckMechanism {
                mechanism: Mechanism::Plain,
                ssf: 128,
            })
            .await;
        assert!(matches!(encrypted, AuthResponse::Ok));
    }

    #[tokio::test]
    async fn virtual_host_shares_its_realm() {
        let auth = auth();
        let response = auth
            .handle(AuthRequest::Realm {
                stream_to: Some("vhost.example.net".to_string()),
            })
            .await;
        match response {
            AuthResponse::Realm(realm) => assert_eq!(realm, "example.net"),
            other => panic!("expected realm, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn authzid_must_be_a_known_bare_jid() {
        let auth = auth();
        let good = auth
            .handle(AuthRequest::CheckAuthzid {
                authzid: "alice@example.net".to_string(),
            })
            .await;
        assert!(matches!(good, AuthResponse::Ok));

        let with_resource = auth
            .handle(AuthRequest::CheckAuthzid {
                authzid: "alice@example.net/desk".to_string(),
            })
            .await;
        assert!(matches!(with_resource, AuthResponse::Fail));

        let unknown = auth
            .handle(AuthRequest::CheckAuthzid {
                authzid: "mallory@example.net".to_string(),
            })
            .await;
        assert!(matches!(unknown, AuthResponse::Fail));
    }

    #[tokio::test]
    async fn generated_authzid_is_opaque() {
        let auth = auth();
        let one = auth.handle(AuthRequest::GenAuthzid).await;
        let two = auth.handle(AuthRequest::GenAuthzid).await;
        match (one, two) {
            (AuthResponse::Authzid(a), AuthResponse::Authzid(b)) => {
                assert!(a.starts_with("anon-"));
                assert_ne!(a, b);
            }
            other => panic!("expected authzids, got {:?}", other),
        }
    }
}
