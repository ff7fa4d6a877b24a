use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message_view::PresentationVariant;

pub const DEFAULT_API_BASE_URL: &str = "https://api.text2sql.ai";
pub const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_PAGE_SIZE: usize = 20;

pub const API_BASE_URL_VAR: &str = "TEXT2SQL_API_BASE_URL";
pub const API_KEY_VAR: &str = "TEXT2SQL_API_KEY";
pub const CONNECTION_ID_VAR: &str = "TEXT2SQL_CONNECTION_ID";
pub const BIND_ADDR_VAR: &str = "SQLCHAT_BIND_ADDR";
pub const CONFIG_DIR_VAR: &str = "SQLCHAT_CONFIG_DIR";

const APP_DIR_NAME: &str = "sqlchat";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write settings file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Talk to the local credential-injecting proxy.
    #[default]
    Proxy,
    /// Call the hosted API directly with a bearer token from the environment.
    Direct,
}

/// Chat client settings, read from `settings.toml` in the config directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    #[serde(default)]
    pub endpoint: EndpointKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub variant: PresentationVariant,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: EndpointKind::Proxy,
            base_url: None,
            connection_id: None,
            variant: PresentationVariant::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl ClientSettings {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut settings: Self = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.page_size = settings.page_size.max(1);
        Ok(settings)
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if let Some(parent_dir) = path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| SettingsError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let rendered =
            toml::to_string_pretty(self).map_err(|source| SettingsError::Serialize { source })?;
        fs::write(path, rendered).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn resolved_base_url(&self) -> &str {
        match (self.base_url.as_deref(), self.endpoint) {
            (Some(url), _) if !url.trim().is_empty() => url,
            (_, EndpointKind::Proxy) => DEFAULT_PROXY_URL,
            (_, EndpointKind::Direct) => DEFAULT_API_BASE_URL,
        }
    }
}

/// Server-side settings for the proxy, taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connection_id: Option<String>,
    pub bind_addr: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            connection_id: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl ProxySettings {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from any variable lookup; blank values count as unset.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();
        Self {
            base_url: read(API_BASE_URL_VAR).unwrap_or(defaults.base_url),
            api_key: read(API_KEY_VAR),
            connection_id: read(CONNECTION_ID_VAR),
            bind_addr: read(BIND_ADDR_VAR).unwrap_or(defaults.bind_addr),
        }
    }
}

pub fn config_dir() -> Result<PathBuf, SettingsError> {
    config_dir_from(|name| env::var_os(name), cfg!(target_os = "windows"))
}

/// `SQLCHAT_CONFIG_DIR` wins outright; otherwise the platform config home.
fn config_dir_from(
    lookup: impl Fn(&str) -> Option<OsString>,
    windows: bool,
) -> Result<PathBuf, SettingsError> {
    let base_dir = if let Some(custom) = lookup(CONFIG_DIR_VAR) {
        PathBuf::from(custom)
    } else if windows {
        lookup("APPDATA")
            .map(PathBuf::from)
            .ok_or(SettingsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = lookup("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = lookup("HOME").ok_or(SettingsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join(APP_DIR_NAME))
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    Ok(config_dir()?.join("settings.toml"))
}

pub fn default_log_path() -> Result<PathBuf, SettingsError> {
    Ok(config_dir()?.join("sqlchat.log"))
}
