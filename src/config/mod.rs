//! Daemon configuration and its on-disk store
//!
//! The config is a flat key/value document persisted as pretty JSON. Field
//! names follow the keys exposed on the control surface, so a patch sent by a
//! client, the file on disk and `get_config()` all share one vocabulary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "natpmpd.json";

/// How a mapping is negotiated with the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shell out to an external NAT-PMP client (`natpmpc` compatible output)
    #[default]
    Command,

    /// Speak NAT-PMP to the gateway directly over UDP
    Native,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "command" => Ok(Self::Command),
            "native" => Ok(Self::Native),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run the refresh scheduler
    pub enabled: bool,

    /// Negotiation helper, optionally followed by extra arguments
    pub exec_path: String,

    /// Timeout in seconds for helper and hook processes (0 or less = none)
    pub timeout: i64,

    /// Gateway to negotiate with
    pub gateway_address: String,

    /// Requested public port
    #[serde(alias = "preffered_public_port")]
    pub preferred_public_port: u16,

    /// Requested private port
    #[serde(alias = "preffered_private_port")]
    pub preferred_private_port: u16,

    /// Seconds between refresh cycles
    pub refresh_interval: u64,

    /// Requested mapping lifetime in seconds
    pub lifetime_interval: u32,

    /// Command run on port change (empty = disabled)
    pub portchange_command: String,

    /// Negotiation backend
    pub backend: Backend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            exec_path: "natpmpc".to_string(),
            timeout: 2,
            gateway_address: "10.2.0.1".to_string(),
            preferred_public_port: 1,
            preferred_private_port: 0,
            refresh_interval: 45,
            lifetime_interval: 60,
            portchange_command: String::new(),
            backend: Backend::Command,
        }
    }
}

impl Config {
    /// Process timeout, `None` when disabled
    pub fn process_timeout(&self) -> Option<Duration> {
        if self.timeout > 0 {
            Some(Duration::from_secs(self.timeout as u64))
        } else {
            None
        }
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.refresh_interval == 0 {
            return Err(ConfigError::Invalid(
                "refresh_interval must be at least 1 second".to_string(),
            ));
        }
        if self.backend == Backend::Command && self.exec_path.trim().is_empty() && self.enabled {
            return Err(ConfigError::Invalid(
                "exec_path is required for the command backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial config update; unset keys are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "preffered_public_port")]
    pub preferred_public_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "preffered_private_port")]
    pub preferred_private_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portchange_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
}

macro_rules! patch_fields {
    ($mac:ident) => {
        $mac!(
            enabled,
            exec_path,
            timeout,
            gateway_address,
            preferred_public_port,
            preferred_private_port,
            refresh_interval,
            lifetime_interval,
            portchange_command,
            backend
        )
    };
}

impl ConfigPatch {
    /// True if any key in the patch holds a value different from `config`
    pub fn differs_from(&self, config: &Config) -> bool {
        macro_rules! any_differs {
            ($($field:ident),*) => {
                false $(|| self.$field.as_ref().is_some_and(|v| *v != config.$field))*
            };
        }
        patch_fields!(any_differs)
    }

    /// Copy every set key into `config`
    pub fn apply_to(&self, config: &mut Config) {
        macro_rules! apply {
            ($($field:ident),*) => {{
                $(if let Some(v) = &self.$field {
                    config.$field = v.clone();
                })*
            }};
        }
        patch_fields!(apply);
    }

    /// Set one key from its textual form, as typed on the command line
    pub fn set_from_str(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))
        }

        match key {
            "enabled" => self.enabled = Some(parse(key, value)?),
            "exec_path" => self.exec_path = Some(value.to_string()),
            "timeout" => self.timeout = Some(parse(key, value)?),
            "gateway_address" => self.gateway_address = Some(value.trim().to_string()),
            "preferred_public_port" | "preffered_public_port" => {
                self.preferred_public_port = Some(parse(key, value)?)
            }
            "preferred_private_port" | "preffered_private_port" => {
                self.preferred_private_port = Some(parse(key, value)?)
            }
            "refresh_interval" => self.refresh_interval = Some(parse(key, value)?),
            "lifetime_interval" => self.lifetime_interval = Some(parse(key, value)?),
            "portchange_command" => self.portchange_command = Some(value.to_string()),
            "backend" => self.backend = Some(parse(key, value)?),
            other => return Err(ConfigError::Invalid(format!("unknown key '{}'", other))),
        }
        Ok(())
    }
}

/// JSON file holding the persisted config
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the platform config directory (`~/.config/natpmpd/natpmpd.json` on Linux)
    pub fn default_location() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("natpmpd");
        Self::new(dir.join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, falling back to defaults when the file does not exist
    pub fn load(&self) -> ConfigResult<Config> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", self.path);
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let config: Config = serde_json::from_str(&json)?;
        tracing::debug!("Loaded config from {:?}", self.path);
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> ConfigResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!("Saved config to {:?}", self.path);
        Ok(())
    }
}
