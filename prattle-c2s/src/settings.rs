use std::collections::HashMap;

use anyhow::{anyhow, Error};
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

/// One hosted domain; `realm` lets virtual hosts share a credential realm.
#[derive(Debug, Clone, Deserialize)]
pub struct IdEntry {
    pub name: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_client_port")]
    pub port: u16,
    /// TLS-wrapper port; TLS from the first byte, no STARTTLS.
    pub ssl_port: Option<u16>,
    pub pemfile: Option<String>,
    #[serde(default)]
    pub require_starttls: bool,
    pub ids: Vec<IdEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckSettings {
    #[serde(default = "default_check_interval")]
    pub interval: u64,
    #[serde(default = "default_check_idle")]
    pub idle: u64,
    #[serde(default = "default_check_keepalive")]
    pub keepalive: u64,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            idle: default_check_idle(),
            keepalive: default_check_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ByteLimits {
    #[serde(default = "default_byte_total")]
    pub bytes: u64,
    #[serde(default = "default_rate_seconds")]
    pub seconds: u64,
    #[serde(default = "default_throttle")]
    pub throttle: u64,
}

impl Default for ByteLimits {
    fn default() -> Self {
        Self {
            bytes: default_byte_total(),
            seconds: default_rate_seconds(),
            throttle: default_throttle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectLimits {
    #[serde(default = "default_connect_total")]
    pub connects: u64,
    #[serde(default = "default_rate_seconds")]
    pub seconds: u64,
    #[serde(default = "default_throttle")]
    pub throttle: u64,
}

impl Default for ConnectLimits {
    fn default() -> Self {
        Self {
            connects: default_connect_total(),
            seconds: default_rate_seconds(),
            throttle: default_throttle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccessSettings {
    #[serde(default)]
    pub order: prattle_core::acl::AccessOrder,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IoSettings {
    #[serde(default = "default_max_fds")]
    pub max_fds: usize,
    pub max_stanza_size: Option<usize>,
    #[serde(default)]
    pub check: CheckSettings,
    #[serde(default)]
    pub limits: ByteLimits,
    #[serde(default)]
    pub connect_limits: ConnectLimits,
    #[serde(default)]
    pub access: AccessSettings,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            max_fds: default_max_fds(),
            max_stanza_size: None,
            check: Default::default(),
            limits: Default::default(),
            connect_limits: Default::default(),
            access: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MechanismSettings {
    #[serde(default = "default_true")]
    pub plain: bool,
    #[serde(default = "default_true")]
    pub digest_md5: bool,
    #[serde(default)]
    pub anonymous: bool,
}

impl Default for MechanismSettings {
    fn default() -> Self {
        Self {
            plain: true,
            digest_md5: true,
            anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthregSettings {
    /// SQLite URL; in-memory credentials when absent.
    pub database_url: Option<String>,
    #[serde(default)]
    pub register_enable: bool,
    #[serde(default)]
    pub mechanisms: MechanismSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Our component name with the router.
    pub id: String,
    /// Component name of the session manager sessions are announced to.
    #[serde(default = "default_sm")]
    pub sm: String,
    pub router: RouterSettings,
    pub local: LocalSettings,
    #[serde(default)]
    pub io: IoSettings,
    #[serde(default)]
    pub authreg: AuthregSettings,
    pub pidfile: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PRATTLE_C2S").separator("__"))
            .build()?;
        settings.try_deserialize().map_err(|e| anyhow!(e))
    }

    /// Realm for a hosted domain, honouring the configured realm map.
    pub fn realm_for(&self, domain: &str) -> Option<String> {
        self.local
            .ids
            .iter()
            .find(|entry| entry.name == domain)
            .map(|entry| entry.realm.clone().unwrap_or_else(|| entry.name.clone()))
    }

    pub fn hosts_domain(&self, domain: &str) -> bool {
        self.local.ids.iter().any(|entry| entry.name == domain)
    }

    pub fn realm_map(&self) -> HashMap<String, String> {
        self.local
            .ids
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    entry.realm.clone().unwrap_or_else(|| entry.name.clone()),
                )
            })
            .collect()
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

fn default_client_port() -> u16 {
    5222
}

fn default_sm() -> String {
    "sm".to_string()
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

fn default_check_idle() -> u64 {
    86400
}

fn default_check_keepalive() -> u64 {
    0
}

fn default_max_fds() -> usize {
    1024
}

fn default_byte_total() -> u64 {
    131_072
}

fn default_rate_seconds() -> u64 {
    1
}

fn default_throttle() -> u64 {
    5
}

fn default_connect_total() -> u64 {
    3
}

fn default_true() -> bool {
    true
}
