//! CLI configuration.
//!
//! Read from `~/.config/pixdrop/config.json`. A missing file yields the
//! defaults; an unreadable one is logged and also falls back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pixdrop_upload::EngineConfig;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the upload server.
    pub server_url: String,

    /// Bearer token sent with every request. Empty means anonymous.
    pub api_token: String,

    /// Per-request transport timeout.
    pub request_timeout_secs: u64,

    /// Directory holding resumable sessions. Empty selects the default.
    pub session_dir: String,

    /// Upload engine tunables.
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080/api".into(),
            api_token: String::new(),
            request_timeout_secs: 60,
            session_dir: String::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the default location when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn api_token(&self) -> Option<&str> {
        Some(self.api_token.as_str()).filter(|t| !t.is_empty())
    }

    /// Resolved session directory.
    pub fn session_dir(&self) -> anyhow::Result<PathBuf> {
        if !self.session_dir.is_empty() {
            return Ok(PathBuf::from(&self.session_dir));
        }
        Ok(config_base_dir()?.join("pixdrop").join("sessions"))
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("pixdrop").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| anyhow::anyhow!("APPDATA is not set"))?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
            && !dir.is_empty()
        {
            return Ok(PathBuf::from(dir));
        }
        let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
