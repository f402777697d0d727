use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    error::RelayError,
    hub::HubOptions,
    session::SessionOptions,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Request path the websocket upgrade is served on.
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default cap on concurrent websocket connections.
pub const MAX_CONNECTIONS: usize = 200;

/// Which entry points the process serves is decided by which sections are
/// present:
///
/// ```toml
/// host = "0.0.0.0"
///
/// [broadcast]
/// port = 8080
/// path = "/ws"
/// max_connection_limit = 500
/// send_timeout_ms = 2000
///
/// [negotiation]
/// port = 8081
/// counterpart_timeout_secs = 30
/// candidate_queue_capacity = 8
/// ```
#[derive(Deserialize, Debug, Default)]
pub struct Config {
    pub host: Option<String>,
    pub broadcast: Option<BroadcastConfig>,
    pub negotiation: Option<NegotiationConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BroadcastConfig {
    pub port: u16,
    pub path: Option<String>,
    pub max_connection_limit: Option<usize>,
    pub send_timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NegotiationConfig {
    pub port: u16,
    pub counterpart_timeout_secs: Option<u64>,
    pub candidate_queue_capacity: Option<usize>,
    pub command_queue_capacity: Option<usize>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Config> {
        let toml_string = fs::read_to_string(path)?;
        Config::from_toml(&toml_string)
    }

    pub fn from_toml(toml_string: &str) -> crate::Result<Config> {
        let config: Config = toml::from_str(toml_string)?;
        if config.broadcast.is_none() && config.negotiation.is_none() {
            return Err(RelayError::InvalidConfig(
                "neither [broadcast] nor [negotiation] is configured".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn max_connections(&self) -> usize {
        self.broadcast
            .as_ref()
            .and_then(|broadcast| broadcast.max_connection_limit)
            .unwrap_or(MAX_CONNECTIONS)
    }

    pub fn ws_path(&self) -> &str {
        self.broadcast
            .as_ref()
            .and_then(|broadcast| broadcast.path.as_deref())
            .unwrap_or(DEFAULT_WS_PATH)
    }

    pub fn hub_options(&self) -> HubOptions {
        let defaults = HubOptions::default();
        match &self.broadcast {
            Some(broadcast) => HubOptions {
                send_timeout: broadcast
                    .send_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.send_timeout),
                queue_capacity: broadcast.queue_capacity.unwrap_or(defaults.queue_capacity),
            },
            None => defaults,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        let defaults = SessionOptions::default();
        match &self.negotiation {
            Some(negotiation) => SessionOptions {
                counterpart_timeout: negotiation
                    .counterpart_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.counterpart_timeout),
                candidate_queue_capacity: negotiation
                    .candidate_queue_capacity
                    .unwrap_or(defaults.candidate_queue_capacity),
                command_queue_capacity: negotiation
                    .command_queue_capacity
                    .unwrap_or(defaults.command_queue_capacity),
            },
            None => defaults,
        }
    }
}
