// Конфигурация приложения
// Логирование по умолчанию подробнее в режиме разработки

use crate::error::{Error, Result};
use crate::media::Constraints;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug,webrtc=info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub primary: Constraints,
    pub fallback: Constraints,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            primary: Constraints::rear_camera(),
            fallback: Constraints::any_camera(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Пустой список: серверы по умолчанию
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConfig,
    pub log_filter: String,
    pub signaling_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            media: MediaConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            signaling_url: "ws://localhost:3000/signal".to_owned(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config(format!(
                    "ICE server `{}`: URL cannot be empty",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::Config(format!(
                    "ICE server `{}`: TURN servers require username and credential",
                    server.id
                )));
            }
        }
        if !self.media.fallback.video.enabled && self.media.primary.video.enabled {
            warn!("Fallback constraints disable video; a missing camera will stream audio only");
        }
        Ok(())
    }

    /// Серверы для webrtc-rs
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return default_ice_servers();
        }
        self.ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}

pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".into(),
            "stun:stun1.l.google.com:19302".into(),
        ],
        ..Default::default()
    }]
}
