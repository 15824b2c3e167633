//! Configuration for dpmlink clients.
//!
//! TOML profiles layered under `DPMLINK_` environment variables, credential
//! resolution for settings, and translation to [`dpmlink_core::ClientConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use dpmlink_core::{ClientConfig, DEFAULT_HOST, StaticCredentials};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix; nested keys use `__`
/// (`DPMLINK_DEFAULTS__HOST`).
pub const ENV_PREFIX: &str = "DPMLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("no credentials configured for profile '{profile}': {reason}")]
    NoCredentials { profile: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Settings shared by every profile unless overridden.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-call timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Connect timeout, seconds.
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_idle_capacity")]
    pub plain_idle_capacity: usize,

    #[serde(default = "default_idle_capacity")]
    pub write_idle_capacity: usize,

    #[serde(default = "default_max_open")]
    pub max_open: usize,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum seconds between buffer overflow warnings.
    #[serde(default = "default_drop_warning_interval")]
    pub drop_warning_interval: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            connect_timeout: default_timeout(),
            plain_idle_capacity: default_idle_capacity(),
            write_idle_capacity: default_idle_capacity(),
            max_open: default_max_open(),
            buffer_capacity: default_buffer_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            drop_warning_interval: default_drop_warning_interval(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}
fn default_port() -> u16 {
    dpmlink_core::DEFAULT_PORT
}
fn default_timeout() -> u64 {
    5
}
fn default_idle_capacity() -> usize {
    4
}
fn default_max_open() -> usize {
    256
}
fn default_buffer_capacity() -> usize {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_drop_warning_interval() -> u64 {
    5
}

/// A named connection profile. Unset fields fall back to [`Defaults`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<u64>,
    pub buffer_capacity: Option<usize>,

    /// Role attached to settings.
    pub role: Option<String>,

    /// Principal the settings token was issued to.
    pub principal: Option<String>,

    /// Environment variable holding the settings token.
    pub token_env: Option<String>,

    /// Settings token in plaintext. Prefer `token_env`.
    pub token: Option<String>,
}

impl Config {
    /// Look up `name`, or the default profile when `None`. The default
    /// profile may be absent from the file, in which case it is empty.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, Profile), ConfigError> {
        let name = name
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into());
        match self.profiles.get(&name) {
            Some(profile) => Ok((name, profile.clone())),
            None if Some(&name) == self.default_profile.as_ref() => Ok((name, Profile::default())),
            None => Err(ConfigError::UnknownProfile { profile: name }),
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("gov", "fnal", "dpmlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("dpmlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the platform path and the environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` and the environment. A missing file is
/// not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    tracing::debug!(path = %path.display(), profiles = config.profiles.len(), "config loaded");
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default config");
        Config::default()
    })
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the settings token for a profile: the variable named by
/// `token_env` first, then a plaintext `token`.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
        reason: match &profile.token_env {
            Some(env_name) => format!("{env_name} is not set"),
            None => "no token_env or token".into(),
        },
    })
}

/// Credentials for settings, or `None` for a read-only profile (no
/// principal configured).
pub fn resolve_credentials(
    profile: &Profile,
    profile_name: &str,
) -> Result<Option<StaticCredentials>, ConfigError> {
    let Some(principal) = profile.principal.clone() else {
        return Ok(None);
    };
    let token = resolve_token(profile, profile_name)?;
    if token.expose_secret().is_empty() {
        return Err(ConfigError::NoCredentials {
            profile: profile_name.into(),
            reason: "token is empty".into(),
        });
    }
    Ok(Some(StaticCredentials::new(
        principal,
        token.expose_secret().as_bytes(),
    )))
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ClientConfig` for the named profile (or the default one).
pub fn profile_to_client_config(
    config: &Config,
    profile_name: Option<&str>,
) -> Result<ClientConfig, ConfigError> {
    let (name, profile) = config.profile(profile_name)?;
    let d = &config.defaults;

    let port = profile.port.unwrap_or(d.port);
    if port == 0 {
        return Err(invalid("port", "must be non-zero"));
    }
    let timeout = profile.timeout.unwrap_or(d.timeout);
    if timeout == 0 {
        return Err(invalid("timeout", "must be at least one second"));
    }
    let buffer_capacity = profile.buffer_capacity.unwrap_or(d.buffer_capacity);
    for (field, value) in [
        ("buffer_capacity", buffer_capacity),
        ("max_open", d.max_open),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be at least 1"));
        }
    }

    let host = profile.host.clone().unwrap_or_else(|| d.host.clone());
    let mut client = ClientConfig::new(host, port);
    client.timeout = Duration::from_secs(timeout);
    client.connect_timeout = Duration::from_secs(d.connect_timeout);
    client.plain_idle_capacity = d.plain_idle_capacity;
    client.write_idle_capacity = d.write_idle_capacity;
    client.max_open = d.max_open;
    client.buffer_capacity = buffer_capacity;
    client.poll_interval = Duration::from_millis(d.poll_interval_ms);
    client.drop_warning_interval = Duration::from_secs(d.drop_warning_interval);
    client.role.clone_from(&profile.role);

    if let Some(credentials) = resolve_credentials(&profile, &name)? {
        client = client.with_credentials(Arc::new(credentials));
    }
    tracing::debug!(profile = %name, host = %client.host, port, "profile resolved");
    Ok(client)
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}
