use serde::{Deserialize, Serialize};
use shared::secret::random_secret;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("server id cannot be empty")]
    EmptyId,

    #[error("slug must be non-empty and contain only [a-z0-9-]: {0:?}")]
    InvalidSlug(String),

    #[error("slug already used by another server: {0}")]
    DuplicateSlug(String),

    #[error("user id cannot be empty")]
    EmptyUserId,
}

/// The two transports a relay exposes through the reverse proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Tcp, Transport::Udp];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Listener settings for one transport.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Protocol {
    /// Public port; 0 means "not configured".
    pub port: u16,
    /// Path segment the bridging route matches on.
    pub path: String,
    /// Percent-encoded obfuscation prefix handed to clients that opt in.
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Transports {
    pub tcp: Protocol,
    pub udp: Protocol,
}

impl Transports {
    pub fn get(&self, transport: Transport) -> &Protocol {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    /// Configured (non-zero) ports, TCP first.
    pub fn ports(&self) -> Vec<u16> {
        [self.tcp.port, self.udp.port]
            .into_iter()
            .filter(|port| *port != 0)
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Settings of a server whose proxy is administered over HTTP.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RemoteSync {
    /// Full URL, or a path appended to the server's public domain.
    pub admin_endpoint: String,
    pub basic_auth: BasicAuth,
    /// Cron expression for periodic reconciliation.
    pub sync_schedule: Option<String>,
}

/// Where the proxy configuration of a server lives.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncMode {
    /// Configuration file colocated with this process.
    Local,
    /// Configuration served by the proxy's admin API.
    Remote(RemoteSync),
}

impl SyncMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Local => "local",
            SyncMode::Remote(_) => "remote",
        }
    }
}

/// One relay server descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Server {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub override_domain: Option<String>,
    #[serde(default)]
    pub metrics_secret: String,
    #[serde(default)]
    pub transports: Transports,
    pub sync: SyncMode,
}

impl Server {
    pub fn remote(&self) -> Option<&RemoteSync> {
        match &self.sync {
            SyncMode::Remote(remote) => Some(remote),
            SyncMode::Local => None,
        }
    }

    pub fn remote_mut(&mut self) -> Option<&mut RemoteSync> {
        match &mut self.sync {
            SyncMode::Remote(remote) => Some(remote),
            SyncMode::Local => None,
        }
    }

    /// Fills in secrets that must exist once the server is persisted.
    /// Returns true if anything was generated.
    pub fn ensure_secrets(&mut self) -> bool {
        if self.metrics_secret.is_empty() {
            self.metrics_secret = random_secret();
            return true;
        }
        false
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }

        let slug_ok = !self.slug.is_empty()
            && self
                .slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !slug_ok {
            return Err(ValidationError::InvalidSlug(self.slug.clone()));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    User,
    Admin,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub role: Role,
    pub premium: bool,
    /// Personal secret embedded in the user's connect URL.
    pub secret: String,
    pub prefix_enabled: bool,
    pub preferred_server: Option<String>,
    pub reverse_server_enabled: bool,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.role != Role::Guest
    }

    /// Whether this user may hold an access key on `server`.
    pub fn can_use(&self, server: &Server) -> bool {
        self.is_active() && (!server.premium || self.premium)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub app_domain: String,
    pub app_domain_reverse: Option<String>,
    pub app_title: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            app_domain: "localhost".into(),
            app_domain_reverse: None,
            app_title: "Outline".into(),
        }
    }
}
