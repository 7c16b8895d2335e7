//! In-memory registry, optionally mirrored to a YAML file.

use crate::models::{AppSettings, Server, User, ValidationError};
use crate::registry::{Registry, RegistryError, RegistryEvent, ServerFilter};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, broadcast};

const EVENT_CAPACITY: usize = 256;

/// On-disk layout of the registry file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RegistryData {
    pub settings: AppSettings,
    pub servers: Vec<Server>,
    pub users: Vec<User>,
}

#[derive(Clone, Default)]
struct State {
    settings: AppSettings,
    servers: IndexMap<String, Server>,
    users: IndexMap<String, User>,
}

impl State {
    fn from_data(data: RegistryData) -> Result<Self, RegistryError> {
        let mut state = State {
            settings: data.settings,
            ..Default::default()
        };
        for mut server in data.servers {
            server.validate()?;
            state.check_slug(&server)?;
            server.ensure_secrets();
            state.servers.insert(server.id.clone(), server);
        }
        for user in data.users {
            if user.id.is_empty() {
                return Err(ValidationError::EmptyUserId.into());
            }
            state.users.insert(user.id.clone(), user);
        }
        Ok(state)
    }

    fn to_data(&self) -> RegistryData {
        RegistryData {
            settings: self.settings.clone(),
            servers: self.servers.values().cloned().collect(),
            users: self.users.values().cloned().collect(),
        }
    }

    fn check_slug(&self, server: &Server) -> Result<(), ValidationError> {
        let taken = self
            .servers
            .values()
            .any(|other| other.id != server.id && other.slug == server.slug);
        if taken {
            return Err(ValidationError::DuplicateSlug(server.slug.clone()));
        }
        Ok(())
    }
}

pub struct LocalRegistry {
    state: RwLock<State>,
    path: Option<PathBuf>,
    // Serializes mutations so the file always reflects the latest state.
    write_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl LocalRegistry {
    /// Loads the registry from `path`. A missing file starts an empty
    /// registry that will be created on the first write.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_yaml::from_str(&contents)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "registry file not found, starting empty");
                RegistryData::default()
            }
            Err(e) => return Err(e.into()),
        };
        let state = State::from_data(data)?;
        tracing::info!(
            servers = state.servers.len(),
            users = state.users.len(),
            "registry loaded"
        );
        Ok(Self::with_state(state, Some(path)))
    }

    /// A registry that lives only in memory.
    pub fn in_memory(data: RegistryData) -> Result<Self, RegistryError> {
        Ok(Self::with_state(State::from_data(data)?, None))
    }

    fn with_state(state: State, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        LocalRegistry {
            state: RwLock::new(state),
            path,
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Applies `mutate` to a copy of the state, persists the copy, then
    /// publishes it. Readers never observe a state that failed to persist.
    async fn update<T>(
        &self,
        mutate: impl FnOnce(&mut State) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.state.read().clone();
        let result = mutate(&mut next)?;

        if let Some(path) = &self.path {
            persist(path, &next.to_data()).await?;
        }

        *self.state.write() = next;
        Ok(result)
    }

    fn emit(&self, event: RegistryEvent) {
        tracing::debug!(?event, "registry event");
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

async fn persist(path: &Path, data: &RegistryData) -> Result<(), RegistryError> {
    let contents = serde_yaml::to_string(data)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn list_servers(&self, filter: ServerFilter) -> Result<Vec<Server>, RegistryError> {
        Ok(self
            .state
            .read()
            .servers
            .values()
            .filter(|server| filter.matches(server))
            .cloned()
            .collect())
    }

    async fn get_server(&self, id: &str) -> Result<Server, RegistryError> {
        self.state
            .read()
            .servers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: "server",
                id: id.to_string(),
            })
    }

    async fn save_server(&self, mut server: Server) -> Result<Server, RegistryError> {
        server.validate()?;
        server.ensure_secrets();

        let (saved, created) = self
            .update(|state| {
                state.check_slug(&server)?;
                let created = state
                    .servers
                    .insert(server.id.clone(), server.clone())
                    .is_none();
                Ok((server, created))
            })
            .await?;

        self.emit(match created {
            true => RegistryEvent::ServerCreated(saved.id.clone()),
            false => RegistryEvent::ServerUpdated(saved.id.clone()),
        });
        Ok(saved)
    }

    async fn delete_server(&self, id: &str) -> Result<(), RegistryError> {
        self.update(|state| {
            state
                .servers
                .shift_remove(id)
                .map(|_| ())
                .ok_or_else(|| RegistryError::NotFound {
                    kind: "server",
                    id: id.to_string(),
                })
        })
        .await?;

        self.emit(RegistryEvent::ServerDeleted(id.to_string()));
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>, RegistryError> {
        Ok(self.state.read().users.values().cloned().collect())
    }

    async fn get_user(&self, id: &str) -> Result<User, RegistryError> {
        self.state
            .read()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: "user",
                id: id.to_string(),
            })
    }

    async fn save_user(&self, user: User) -> Result<User, RegistryError> {
        if user.id.is_empty() {
            return Err(ValidationError::EmptyUserId.into());
        }

        let saved = self
            .update(|state| {
                state.users.insert(user.id.clone(), user.clone());
                Ok(user)
            })
            .await?;

        self.emit(RegistryEvent::UserChanged(saved.id.clone()));
        Ok(saved)
    }

    async fn delete_user(&self, id: &str) -> Result<(), RegistryError> {
        self.update(|state| {
            state
                .users
                .shift_remove(id)
                .map(|_| ())
                .ok_or_else(|| RegistryError::NotFound {
                    kind: "user",
                    id: id.to_string(),
                })
        })
        .await?;

        self.emit(RegistryEvent::UserDeleted(id.to_string()));
        Ok(())
    }

    async fn settings(&self) -> Result<AppSettings, RegistryError> {
        Ok(self.state.read().settings.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
