//! Layered service configuration
//!
//! Precedence, lowest first: built-in defaults, the TOML config file, then
//! `RC3_<SECTION>__<KEY>` environment variables. The file is looked up at the
//! `--config` path, then `/etc/rc3/rc3.toml`; a non-empty `RC3_CONFIG_PATH`
//! overrides both.

use ::config::{Config as Layers, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "RC3";
pub const CONFIG_PATH_ENV: &str = "RC3_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rc3/rc3.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub development: DevelopmentConfig,
    pub server: ServerConfig,
    pub proxmox: ProxmoxConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// One of debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentConfig {
    pub pretty_logging: bool,
    /// Accept requests without an identity header, acting as `dev_identity`
    pub bypass_auth: bool,
    pub dev_identity: String,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            pretty_logging: true,
            bypass_auth: true,
            dev_identity: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:8080`
    pub host: String,
    /// Grace period for in-flight requests on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0:8080".to_string(),
            shutdown_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    Proxmox,
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub backend: ClusterBackend,
    /// API root, including the route: `https://pve.example:8006/api2/json`
    pub url: String,
    pub token_id: String,
    pub token_secret: String,
    pub use_tls: bool,
    pub os_template: String,
    pub instance_storage: String,
    /// Budget for all cluster calls made on behalf of one API request
    pub request_timeout_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Proxmox,
            url: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            use_tls: false,
            os_template: "local:vztmpl/ubuntu-22.04-standard_22.04-1_amd64.tar.zst".to_string(),
            instance_storage: "local-lvm".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Request header carrying the caller's identity
    pub identity_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_header: "X-Requester-Id".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the first config file found and the
    /// process environment.
    pub fn load(flag_path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let path = resolve_config_path(flag_path, env_path.as_deref());

        let mut builder = Layers::builder().add_source(Layers::try_from(&Config::default())?);
        if let Some(path) = &path {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_host(&self.server.host) {
            return Err(ConfigError::Invalid(format!(
                "server.host must be <host>:<port>, got '{}'",
                self.server.host
            )));
        }
        if self.proxmox.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "proxmox.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.server.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.shutdown_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.auth.identity_header.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.identity_header must not be empty".to_string(),
            ));
        }

        if self.proxmox.backend == ClusterBackend::Proxmox {
            let required = [
                ("proxmox.url", &self.proxmox.url),
                ("proxmox.token_id", &self.proxmox.token_id),
                ("proxmox.token_secret", &self.proxmox.token_secret),
            ];
            for (key, value) in required {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("{key} is required")));
                }
            }
        }

        Ok(())
    }

    /// Every environment variable the service reads, sorted
    pub fn env_vars() -> Vec<String> {
        let mut vars = Vec::new();
        if let Ok(serde_json::Value::Object(sections)) = serde_json::to_value(Config::default()) {
            for (section, fields) in sections {
                if let serde_json::Value::Object(fields) = fields {
                    for key in fields.keys() {
                        vars.push(format!("{ENV_PREFIX}_{section}__{key}").to_uppercase());
                    }
                }
            }
        }
        vars.push(CONFIG_PATH_ENV.to_string());
        vars.sort();
        vars
    }
}

/// The `--config` path if it names a file, else the system default if that
/// exists. A non-empty env path wins regardless.
fn resolve_config_path(flag_path: Option<&Path>, env_path: Option<&str>) -> Option<PathBuf> {
    if let Some(env_path) = env_path.filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(env_path));
    }

    flag_path
        .into_iter()
        .chain(std::iter::once(Path::new(DEFAULT_CONFIG_PATH)))
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

fn valid_host(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => !name.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
