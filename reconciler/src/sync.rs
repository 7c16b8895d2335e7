//! Where a server's configuration is read from and written to.

use crate::ReconcileError;
use crate::caddy::{ScaffoldOptions, local_scaffold, remote_scaffold};
use crate::document::{ConfigDocument, DocumentFormat};
use crate::remote::AdminClient;
use async_trait::async_trait;
use registry::domains::extract_url_path;
use registry::{AppSettings, BasicAuth, Server};
use shared::secret::random_secret;
use std::io;
use std::path::{Path, PathBuf};

/// Username put on generated admin credentials.
pub const ADMIN_USERNAME: &str = "service";

/// Result of generating a document for a server that has none.
#[derive(Debug)]
pub enum Scaffold {
    Ready(ConfigDocument),
    /// Credentials or paths were generated into the server, which must be
    /// saved before the scaffold can be trusted.
    PendingServerSave,
}

#[async_trait]
pub trait ConfigSync: Send + Sync {
    /// Raw current document, or `None` when there is none yet.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, ReconcileError>;

    async fn persist(&self, doc: &ConfigDocument) -> Result<(), ReconcileError>;

    /// Minimal document for `server`. May fill in missing credentials on
    /// `server`.
    async fn scaffold(
        &self,
        server: &mut Server,
        settings: &AppSettings,
    ) -> Result<Scaffold, ReconcileError>;
}

/// Configuration file on the local filesystem.
pub struct LocalFile {
    path: PathBuf,
    options: ScaffoldOptions,
}

impl LocalFile {
    pub fn new(path: PathBuf, options: ScaffoldOptions) -> Self {
        LocalFile { path, options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes `contents` through a temporary file and a rename, creating parent
/// directories. Returns false when the file already held these bytes.
pub async fn write_if_changed(path: &Path, contents: &[u8]) -> io::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(true)
}

#[async_trait]
impl ConfigSync for LocalFile {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, ReconcileError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, doc: &ConfigDocument) -> Result<(), ReconcileError> {
        let bytes = doc.serialize(DocumentFormat::Json)?;
        if write_if_changed(&self.path, &bytes).await? {
            tracing::debug!(path = %self.path.display(), "configuration file written");
        }
        Ok(())
    }

    async fn scaffold(
        &self,
        server: &mut Server,
        _settings: &AppSettings,
    ) -> Result<Scaffold, ReconcileError> {
        Ok(Scaffold::Ready(local_scaffold(server, &self.options)))
    }
}

/// Configuration served by the proxy's admin API. The last document the API
/// accepted is mirrored to a local file.
pub struct RemoteAdmin {
    client: AdminClient,
    config_url: String,
    auth: BasicAuth,
    mirror: LocalFile,
}

impl RemoteAdmin {
    pub fn new(client: AdminClient, config_url: String, auth: BasicAuth, mirror: LocalFile) -> Self {
        RemoteAdmin {
            client,
            config_url,
            auth,
            mirror,
        }
    }
}

/// Fills in a random admin path and basic auth credentials when missing.
/// Returns true if `server` was changed.
pub fn ensure_admin_credentials(server: &mut Server) -> bool {
    let Some(remote) = server.remote_mut() else {
        return false;
    };

    let mut changed = false;
    if extract_url_path(&remote.admin_endpoint) == "/" {
        remote.admin_endpoint = format!("/{}", random_secret());
        changed = true;
    }
    if !remote.basic_auth.is_complete() {
        remote.basic_auth = BasicAuth {
            username: ADMIN_USERNAME.into(),
            password: random_secret(),
        };
        changed = true;
    }
    changed
}

#[async_trait]
impl ConfigSync for RemoteAdmin {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, ReconcileError> {
        let bytes = self.client.get_config(&self.config_url, &self.auth).await?;
        Ok(Some(bytes))
    }

    /// Patches the admin API, then mirrors what it accepted.
    async fn persist(&self, doc: &ConfigDocument) -> Result<(), ReconcileError> {
        let body = doc.serialize_compact()?;
        self.client
            .patch_config(&self.config_url, &self.auth, body)
            .await?;
        tracing::debug!(url = %self.config_url, "remote configuration patched");
        self.mirror.persist(doc).await
    }

    async fn scaffold(
        &self,
        server: &mut Server,
        settings: &AppSettings,
    ) -> Result<Scaffold, ReconcileError> {
        if ensure_admin_credentials(server) {
            return Ok(Scaffold::PendingServerSave);
        }
        let Some(remote) = server.remote() else {
            return self.mirror.scaffold(server, settings).await;
        };

        let admin_path = extract_url_path(&remote.admin_endpoint);
        let username = remote.basic_auth.username.clone();
        let password = remote.basic_auth.password.clone();
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
            .await
            .map_err(|e| ReconcileError::Io(io::Error::other(e)))??;

        Ok(Scaffold::Ready(remote_scaffold(
            server,
            settings,
            &self.mirror.options,
            &admin_path,
            &username,
            &hash,
        )))
    }
}

/// The backend a server's sync mode selects.
pub enum SyncBackend {
    Local(LocalFile),
    Remote(RemoteAdmin),
}

impl SyncBackend {
    /// Local copy of the configuration. For remote servers this is the mirror
    /// written instead of the admin API when the API is unreachable.
    pub fn local(&self) -> &LocalFile {
        match self {
            SyncBackend::Local(file) => file,
            SyncBackend::Remote(remote) => &remote.mirror,
        }
    }

    fn inner(&self) -> &dyn ConfigSync {
        match self {
            SyncBackend::Local(file) => file,
            SyncBackend::Remote(remote) => remote,
        }
    }
}

#[async_trait]
impl ConfigSync for SyncBackend {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, ReconcileError> {
        self.inner().fetch().await
    }

    async fn persist(&self, doc: &ConfigDocument) -> Result<(), ReconcileError> {
        self.inner().persist(doc).await
    }

    async fn scaffold(
        &self,
        server: &mut Server,
        settings: &AppSettings,
    ) -> Result<Scaffold, ReconcileError> {
        self.inner().scaffold(server, settings).await
    }
}
