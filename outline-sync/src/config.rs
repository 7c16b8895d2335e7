use reconciler::caddy::ScaffoldOptions;
use reconciler::{ReconcilerConfig, SchedulerConfig, parse_schedule};
use serde::Deserialize;
use shared::secret::random_secret;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use token_store::TokenStoreConfig;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("port cannot be 0 ({0})")]
    InvalidPort(&'static str),

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("sliding ttl must not exceed absolute ttl")]
    SlidingExceedsAbsolute,

    #[error("cipher cannot be empty")]
    EmptyCipher,

    #[error("technical key name cannot be empty")]
    EmptyTechnicalKey,

    #[error("invalid default sync schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn validate(&self, name: &'static str) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort(name));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_listener() -> Listener {
    Listener {
        host: "0.0.0.0".into(),
        port: 8090,
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 8091,
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// YAML file holding servers, users and app settings.
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            path: PathBuf::from("./registry.yaml"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub storage_path: PathBuf,
    pub cipher: String,
    pub technical_key_name: String,
    /// Random per process when unset, which rotates the technical key on
    /// every restart.
    pub technical_key_secret: Option<String>,
    pub admin_socket: String,
    pub storage_root: String,
    pub admin_upstream: String,
    pub default_sync_schedule: String,
    pub debounce_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let scaffold = ScaffoldOptions::default();
        RelayConfig {
            storage_path: PathBuf::from("./generated/outline"),
            cipher: "chacha20-ietf-poly1305".into(),
            technical_key_name: "service".into(),
            technical_key_secret: None,
            admin_socket: scaffold.admin_socket,
            storage_root: scaffold.storage_root,
            admin_upstream: scaffold.admin_upstream,
            default_sync_schedule: "0 0 * * *".into(),
            debounce_ms: 2000,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenStoreSection {
    pub sliding_ttl_secs: u64,
    pub absolute_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TokenStoreSection {
    fn default() -> Self {
        TokenStoreSection {
            sliding_ttl_secs: 4 * 3600,
            absolute_ttl_secs: 48 * 3600,
            sweep_interval_secs: 8 * 3600,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            timeout_secs: 7,
            retries: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Connect API.
    #[serde(default = "default_listener")]
    pub listener: Listener,
    /// Health and readiness endpoints.
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub token_store: TokenStoreSection,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate("listener")?;
        self.admin_listener.validate("admin_listener")?;
        if let Some(metrics) = &self.metrics {
            if metrics.statsd_port == 0 {
                return Err(ValidationError::InvalidPort("metrics"));
            }
        }

        let tokens = &self.token_store;
        for (name, value) in [
            ("token_store.sliding_ttl_secs", tokens.sliding_ttl_secs),
            ("token_store.absolute_ttl_secs", tokens.absolute_ttl_secs),
            ("token_store.sweep_interval_secs", tokens.sweep_interval_secs),
            ("relay.debounce_ms", self.relay.debounce_ms),
            ("relay.shutdown_grace_secs", self.relay.shutdown_grace_secs),
            ("remote.timeout_secs", self.remote.timeout_secs),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroDuration(name));
            }
        }
        if tokens.sliding_ttl_secs > tokens.absolute_ttl_secs {
            return Err(ValidationError::SlidingExceedsAbsolute);
        }

        if self.relay.cipher.is_empty() {
            return Err(ValidationError::EmptyCipher);
        }
        if self.relay.technical_key_name.is_empty() {
            return Err(ValidationError::EmptyTechnicalKey);
        }
        parse_schedule(&self.relay.default_sync_schedule).map_err(|e| {
            ValidationError::InvalidSchedule {
                schedule: self.relay.default_sync_schedule.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(())
    }

    pub fn token_store_config(&self) -> TokenStoreConfig {
        TokenStoreConfig {
            sliding_ttl: Duration::from_secs(self.token_store.sliding_ttl_secs),
            absolute_ttl: Duration::from_secs(self.token_store.absolute_ttl_secs),
            sweep_interval: Duration::from_secs(self.token_store.sweep_interval_secs),
            technical_key_name: self.relay.technical_key_name.clone(),
            technical_key_secret: self
                .relay
                .technical_key_secret
                .clone()
                .unwrap_or_else(random_secret),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            storage_path: self.relay.storage_path.clone(),
            cipher: self.relay.cipher.clone(),
            scaffold: ScaffoldOptions {
                admin_socket: self.relay.admin_socket.clone(),
                storage_root: self.relay.storage_root.clone(),
                admin_upstream: self.relay.admin_upstream.clone(),
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(self.relay.debounce_ms),
            default_schedule: self.relay.default_sync_schedule.clone(),
            shutdown_grace: Duration::from_secs(self.relay.shutdown_grace_secs),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }
}
