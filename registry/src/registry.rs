use crate::models::{AppSettings, Server, User, ValidationError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("registry file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Mutation notifications, emitted after the change is visible to readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    ServerCreated(String),
    ServerUpdated(String),
    ServerDeleted(String),
    UserChanged(String),
    UserDeleted(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerFilter {
    #[default]
    All,
    Enabled,
}

impl ServerFilter {
    pub fn matches(&self, server: &Server) -> bool {
        match self {
            ServerFilter::All => true,
            ServerFilter::Enabled => server.enabled,
        }
    }
}

/// Access to server and user records.
///
/// Writes validate their input and fill in generated secrets before storing.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_servers(&self, filter: ServerFilter) -> Result<Vec<Server>, RegistryError>;

    async fn get_server(&self, id: &str) -> Result<Server, RegistryError>;

    /// Inserts or replaces `server` and returns the stored version.
    async fn save_server(&self, server: Server) -> Result<Server, RegistryError>;

    async fn delete_server(&self, id: &str) -> Result<(), RegistryError>;

    async fn list_users(&self) -> Result<Vec<User>, RegistryError>;

    async fn get_user(&self, id: &str) -> Result<User, RegistryError>;

    async fn save_user(&self, user: User) -> Result<User, RegistryError>;

    async fn delete_user(&self, id: &str) -> Result<(), RegistryError>;

    async fn settings(&self) -> Result<AppSettings, RegistryError>;

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
