use anyhow::{anyhow, Error};
use rand::{RngCore, SeedableRng};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_init")]
    pub init: u32,
    #[serde(default = "default_retry_lost")]
    pub lost: u32,
    #[serde(default = "default_retry_sleep")]
    pub sleep: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            init: default_retry_init(),
            lost: default_retry_lost(),
            sleep: default_retry_sleep(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_router_ip")]
    pub ip: String,
    #[serde(default = "default_router_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    pub pemfile: Option<String>,
    /// Dialback secret; generated at startup when absent.
    pub secret: Option<String>,
    /// Component name of the external resolver.
    #[serde(default = "default_resolver")]
    pub resolver: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckSettings {
    #[serde(default = "default_check_interval")]
    pub interval: u64,
    /// Ceiling for dialback establishment and pending resolves.
    #[serde(default = "default_check_queue")]
    pub queue: u64,
    #[serde(default)]
    pub keepalive: u64,
    #[serde(default)]
    pub idle: u64,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            queue: default_check_queue(),
            keepalive: 0,
            idle: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecuritySettings {
    #[serde(default)]
    pub require_tls: bool,
    #[serde(default)]
    pub enable_whitelist: bool,
    #[serde(default)]
    pub whitelist_domain: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IoSettings {
    pub max_stanza_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Our component name with the router.
    pub id: String,
    pub router: RouterSettings,
    pub local: LocalSettings,
    #[serde(default)]
    pub check: CheckSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub io: IoSettings,
    pub pidfile: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PRATTLE_S2S").separator("__"))
            .build()?;
        settings.try_deserialize().map_err(|e| anyhow!(e))
    }

    /// The configured dialback secret, or a fresh 40-character random one.
    pub fn secret(&self) -> String {
        match &self.local.secret {
            Some(secret) => secret.clone(),
            None => {
                let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
                let mut raw = [0u8; 20];
                rng.fill_bytes(&mut raw);
                raw.iter().map(|b| format!("{:02x}", b)).collect()
            }
        }
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_router_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_router_port() -> u16 {
    5347
}

fn default_peer_port() -> u16 {
    5269
}

fn default_resolver() -> String {
    "resolver".to_string()
}

fn default_retry_init() -> u32 {
    3
}

fn default_retry_lost() -> u32 {
    3
}

fn default_retry_sleep() -> u64 {
    2
}

fn default_check_interval() -> u64 {
    60
}

fn default_check_queue() -> u64 {
    60
}
