use serde::Deserialize;
use std::{env, fs};

const CONF_PATH: &str = "config/config.json";

/// Server settings: optional JSON file, overridden by environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8961,
            debug: false,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let mut config = match fs::read_to_string(CONF_PATH) {
            Ok(raw) => Self::from_file(&raw),
            Err(_) => Self::default(),
        };

        if let Ok(host) = env::var("MPV_SYNC_SERVER_HOST") {
            config.host = host;
        }
        if let Some(port) = env::var("MPV_SYNC_SERVER_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
        {
            config.port = port;
        }
        if let Ok(raw) = env::var("MPV_SYNC_SERVER_DEBUG") {
            config.debug = raw == "1" || raw.eq_ignore_ascii_case("true");
        }
        config
    }

    fn from_file(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!("unreadable {CONF_PATH}, using defaults: {e}");
            Self::default()
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
