//! Configuration types for the switchboard client.
//! Parsed from ~/.switchboard/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use switchboard_manager::ManagerTuning;
use switchboard_protocol::tls::QuicTimings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub tuning: ManagerTuning,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: String,
    /// Terminal id sent with every request. Falls back to the persisted one.
    pub terminal: Option<String>,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default)]
    pub authenticated: bool,
    pub session: Option<String>,
    #[serde(default = "default_node_list_action")]
    pub node_list_action: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            bootstrap_url: default_bootstrap_url(),
            terminal: None,
            state_file: default_state_file(),
            authenticated: false,
            session: None,
            node_list_action: default_node_list_action(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_1800")]
    pub logout_secs: u64,
    #[serde(default = "default_40")]
    pub renew_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            logout_secs: 1800,
            renew_secs: 40,
            request_timeout_ms: default_request_timeout_ms(),
            api_timeout_ms: default_api_timeout_ms(),
        }
    }
}

impl SessionSection {
    pub fn logout_after(&self) -> Duration {
        Duration::from_secs(self.logout_secs)
    }

    pub fn renew_every(&self) -> Duration {
        Duration::from_secs(self.renew_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// TLS server name for IP-literal authorities.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// DER CA certificate. Without one, dispatcher certificates are not verified.
    pub ca_cert: Option<String>,
    #[serde(default = "default_60")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_10")]
    pub keepalive_secs: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            ca_cert: None,
            idle_timeout_secs: 60,
            keepalive_secs: 10,
            bind_addr: default_bind_addr(),
        }
    }
}

impl TransportSection {
    pub fn timings(&self) -> QuicTimings {
        QuicTimings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keep_alive: Duration::from_secs(self.keepalive_secs),
        }
    }
}

// Default value functions
fn default_bootstrap_url() -> String {
    "http://127.0.0.1:8080/zone.json".into()
}
fn default_state_file() -> String {
    "~/.switchboard/state.json".into()
}
fn default_node_list_action() -> String {
    "API.getNodeList~1".into()
}
fn default_server_name() -> String {
    switchboard_protocol::tls::DEFAULT_SERVER_NAME.into()
}
fn default_bind_addr() -> String {
    "0.0.0.0:0".into()
}
fn default_request_timeout_ms() -> u64 {
    switchboard_protocol::DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_api_timeout_ms() -> u64 {
    switchboard_protocol::API_FETCH_TIMEOUT_MS
}
fn default_10() -> u64 {
    10
}
fn default_40() -> u64 {
    40
}
fn default_60() -> u64 {
    60
}
fn default_1800() -> u64 {
    1800
}

impl ClientConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
