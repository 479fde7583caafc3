use std::collections::HashMap;

use anyhow::{anyhow, Error};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Certificate chain + key for component STARTTLS; absent means TLS is
    /// not offered.
    pub pemfile: Option<String>,
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

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IoSettings {
    pub max_stanza_size: Option<usize>,
    #[serde(default)]
    pub limits: ByteLimits,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessageLoggingSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_roll_megs")]
    pub roll_megs: u64,
    #[serde(default = "default_roll_days")]
    pub roll_days: u64,
    #[serde(default)]
    pub filter_muc_messages_from: Vec<String>,
    #[serde(default)]
    pub log_group_chat: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Our component name; packets addressed here with no matching route are
    /// bounced as unknown rather than forwarded to the default route.
    pub id: String,
    pub local: LocalSettings,
    /// Component credentials, user to shared secret.
    #[serde(default)]
    pub users: HashMap<String, String>,
    /// SASL realm offered to components; defaults to `id`.
    pub realm: Option<String>,
    /// Access lists: `bind`, `route`, `log`, and the `all` wildcard.
    #[serde(default)]
    pub aci: HashMap<String, Vec<String>>,
    /// Destination-domain rewrites applied before lookup.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Component name that picks up packets for unknown domains (the s2s
    /// gateway, normally).
    pub default_route: Option<String>,
    /// Names that may be bound by several components at once.
    #[serde(default)]
    pub multi: Vec<String>,
    #[serde(default)]
    pub io: IoSettings,
    #[serde(default)]
    pub message_logging: MessageLoggingSettings,
    pub pidfile: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PRATTLE_ROUTER").separator("__"))
            .build()?;
        settings.try_deserialize().map_err(|e| anyhow!(e))
    }

    pub fn realm(&self) -> &str {
        self.realm.as_deref().unwrap_or(&self.id)
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5347
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

fn default_log_file() -> String {
    "message.log".to_string()
}

fn default_roll_megs() -> u64 {
    100
}

fn default_roll_days() -> u64 {
    1
}
