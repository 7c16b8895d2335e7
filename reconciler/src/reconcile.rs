use crate::caddy::{self, CaddyError, OutlineKey, ScaffoldOptions};
use crate::document::{ConfigDocument, DocumentError, DocumentFormat};
use crate::metrics_defs::{RECONCILE_DURATION, RECONCILE_OUTCOME, RECONCILE_REMOTE_FALLBACK};
use crate::remote::{AdminClient, RemoteError};
use crate::sync::{ConfigSync, LocalFile, RemoteAdmin, Scaffold, SyncBackend};
use registry::domains::admin_url;
use registry::{AppSettings, Registry, RegistryError, Server, ServerFilter, SyncMode, User};
use shared::{counter, histogram};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use token_store::TokenStore;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("admin API error: {0}")]
    Transient(#[from] RemoteError),

    #[error("malformed configuration: {0}")]
    Parse(#[from] DocumentError),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("file error: {0}")]
    Io(#[from] io::Error),

    #[error("could not hash admin password: {0}")]
    Credentials(#[from] bcrypt::BcryptError),
}

impl From<CaddyError> for ReconcileError {
    fn from(err: CaddyError) -> Self {
        match err {
            CaddyError::Document(e) => ReconcileError::Parse(e),
            other => ReconcileError::NotFound(other.to_string()),
        }
    }
}

/// How one reconciliation attempt ended.
#[derive(Debug)]
pub enum Outcome {
    Applied,
    SkippedNoChange,
    /// Admin credentials were generated and saved on the server; the next
    /// attempt picks them up.
    DeferredPendingServerSave,
    Failed(ReconcileError),
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::SkippedNoChange => "skipped_no_change",
            Outcome::DeferredPendingServerSave => "deferred",
            Outcome::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Root of the per-server configuration files.
    pub storage_path: PathBuf,
    pub cipher: String,
    pub scaffold: ScaffoldOptions,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            storage_path: PathBuf::from("./generated/outline"),
            cipher: "chacha20-ietf-poly1305".into(),
            scaffold: ScaffoldOptions::default(),
        }
    }
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    tokens: TokenStore,
    admin: AdminClient,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        tokens: TokenStore,
        admin: AdminClient,
        config: ReconcilerConfig,
    ) -> Self {
        Reconciler {
            registry,
            tokens,
            admin,
            config,
        }
    }

    pub fn local_config_path(&self, slug: &str) -> PathBuf {
        self.config.storage_path.join(slug).join("caddy.config.json")
    }

    /// Keys `server` should carry: tokens of users allowed on it, plus the
    /// technical key.
    pub fn desired_keys(&self, server: &Server, users: &HashMap<String, User>) -> Vec<OutlineKey> {
        self.tokens
            .get_all_by_server(&server.id)
            .into_iter()
            .filter(|token| {
                self.tokens.is_technical(token)
                    || users
                        .get(&token.user_id)
                        .is_some_and(|user| user.can_use(server))
            })
            .map(|token| OutlineKey {
                id: token.user_id,
                secret: token.secret,
                cipher: self.config.cipher.clone(),
            })
            .collect()
    }

    fn backend(&self, server: &Server, settings: &AppSettings) -> SyncBackend {
        let file = LocalFile::new(
            self.local_config_path(&server.slug),
            self.config.scaffold.clone(),
        );
        match (&server.sync, admin_url(server, settings, "config/")) {
            (SyncMode::Remote(remote), Some(url)) => SyncBackend::Remote(RemoteAdmin::new(
                self.admin.clone(),
                url,
                remote.basic_auth.clone(),
                file,
            )),
            _ => SyncBackend::Local(file),
        }
    }

    /// Runs one pass for `server_id`. Errors are logged and reported in the
    /// outcome, never returned.
    pub async fn reconcile(&self, server_id: &str) -> Outcome {
        let start = Instant::now();
        let outcome = match self.try_reconcile(server_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "reconciliation failed");
                Outcome::Failed(e)
            }
        };

        histogram!(RECONCILE_DURATION).record(start.elapsed().as_secs_f64());
        counter!(RECONCILE_OUTCOME, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    /// Reconciles every enabled server, one after the other.
    pub async fn reconcile_all(&self) -> Vec<(String, Outcome)> {
        let servers = match self.registry.list_servers(ServerFilter::Enabled).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(error = %e, "could not list servers");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(servers.len());
        for server in servers {
            let outcome = self.reconcile(&server.id).await;
            outcomes.push((server.id, outcome));
        }
        outcomes
    }

    async fn try_reconcile(&self, server_id: &str) -> Result<Outcome, ReconcileError> {
        let mut server = self.registry.get_server(server_id).await?;
        let settings = self.registry.settings().await?;
        let users: HashMap<String, User> = self
            .registry
            .list_users()
            .await?
            .into_iter()
            .map(|user| (user.id.clone(), user))
            .collect();

        let keys = self.desired_keys(&server, &users);
        let backend = self.backend(&server, &settings);

        let (current, local_only) = match backend.fetch().await {
            Ok(Some(raw)) => (ConfigDocument::parse(&raw, DocumentFormat::Json)?, false),
            Ok(None) => match backend.scaffold(&mut server, &settings).await? {
                Scaffold::Ready(doc) => (doc, false),
                Scaffold::PendingServerSave => return self.save_generated(server).await,
            },
            Err(e) if matches!(backend, SyncBackend::Remote(_)) => {
                tracing::warn!(
                    server_id,
                    slug = %server.slug,
                    error = %e,
                    "remote configuration unavailable, writing a local scaffold only"
                );
                counter!(RECONCILE_REMOTE_FALLBACK).increment(1);
                match backend.scaffold(&mut server, &settings).await? {
                    Scaffold::Ready(doc) => (doc, true),
                    Scaffold::PendingServerSave => return self.save_generated(server).await,
                }
            }
            Err(e) => return Err(e),
        };

        let mut doc = current.clone();
        let keys_changed = caddy::keys_changed(&doc, &keys);
        caddy::strip_bridge_routes(&mut doc)?;
        let server_key = caddy::find_server_key(&doc, &server)?;
        caddy::inject_bridge_routes(&mut doc, &server_key, &server, &settings)?;
        if keys_changed {
            caddy::set_outline_app(&mut doc, &server.slug, &keys)?;
        }

        if doc == current {
            tracing::debug!(server_id, slug = %server.slug, "configuration already up to date");
            return Ok(Outcome::SkippedNoChange);
        }

        if local_only {
            backend.local().persist(&doc).await?;
        } else {
            backend.persist(&doc).await?;
        }

        tracing::info!(
            server_id,
            slug = %server.slug,
            sync = server.sync.as_str(),
            server_key = %server_key,
            keys = keys.len(),
            keys_changed,
            local_only,
            "configuration applied"
        );
        Ok(Outcome::Applied)
    }

    async fn save_generated(&self, server: Server) -> Result<Outcome, ReconcileError> {
        tracing::info!(
            server_id = %server.id,
            slug = %server.slug,
            "generated admin credentials, saving server before configuring"
        );
        self.registry.save_server(server).await?;
        Ok(Outcome::DeferredPendingServerSave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddy::BRIDGE_HANDLER;
    use registry::{
        BasicAuth, LocalRegistry, Protocol, RegistryData, RegistryEvent, RemoteSync, Role,
        Transports,
    };
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;
    use token_store::TokenStoreConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        reconciler: Reconciler,
        registry: Arc<LocalRegistry>,
        tokens: TokenStore,
        _dir: tempfile::TempDir,
    }

    fn server(id: &str, slug: &str, sync: SyncMode) -> Server {
        Server {
            id: id.into(),
            slug: slug.into(),
            enabled: true,
            premium: false,
            override_domain: None,
            metrics_secret: String::new(),
            transports: Transports {
                tcp: Protocol {
                    port: 8443,
                    path: "tcp".into(),
                    prefix: None,
                },
                udp: Protocol {
                    port: 8443,
                    path: "udp".into(),
                    prefix: None,
                },
            },
            sync,
        }
    }

    fn remote(endpoint: String) -> SyncMode {
        SyncMode::Remote(RemoteSync {
            admin_endpoint: endpoint,
            basic_auth: BasicAuth {
                username: "service".into(),
                password: "pw".into(),
            },
            sync_schedule: None,
        })
    }

    fn user(id: &str, role: Role) -> User {
        User {
            id: id.into(),
            role,
            ..Default::default()
        }
    }

    fn harness(servers: Vec<Server>, users: Vec<User>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            LocalRegistry::in_memory(RegistryData {
                settings: AppSettings {
                    app_domain: "vpn.example.com".into(),
                    ..Default::default()
                },
                servers,
                users,
            })
            .unwrap(),
        );
        let tokens = TokenStore::new(TokenStoreConfig {
            technical_key_secret: "technical".into(),
            ..Default::default()
        });
        let admin = AdminClient::new(Duration::from_secs(2), 0)
            .unwrap()
            .with_base_delay(Duration::from_millis(1));
        let reconciler = Reconciler::new(
            registry.clone(),
            tokens.clone(),
            admin,
            ReconcilerConfig {
                storage_path: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        Harness {
            reconciler,
            registry,
            tokens,
            _dir: dir,
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    fn key_ids(config: &Value) -> HashSet<String> {
        config["apps"]["outline"]["connection_handlers"][0]["handle"]["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|key| key["id"].as_str().unwrap().to_string())
            .collect()
    }

    fn bridge_route_count(config: &Value, block: &str) -> usize {
        config["apps"]["http"]["servers"][block]["routes"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|route| route["handle"][0]["handler"] == json!(BRIDGE_HANDLER))
            .count()
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_local_first_run_writes_scaffold() {
        let h = harness(
            vec![server("s1", "ams", SyncMode::Local)],
            vec![user("u1", Role::User)],
        );
        h.tokens.get_or_generate("u1", "s1");

        assert!(matches!(h.reconciler.reconcile("s1").await, Outcome::Applied));

        let config = read_json(&h.reconciler.local_config_path("ams"));
        assert_eq!(key_ids(&config), set(&["u1", "service"]));
        assert_eq!(bridge_route_count(&config, "srv0"), 2);
        assert_eq!(
            config["apps"]["http"]["servers"]["srv0"]["routes"][0]["match"][0]["host"],
            json!(["ams.vpn.example.com"])
        );
    }

    #[tokio::test]
    async fn test_second_run_is_skipped_and_file_untouched() {
        let h = harness(
            vec![server("s1", "ams", SyncMode::Local)],
            vec![user("u1", Role::User)],
        );
        h.tokens.get_or_generate("u1", "s1");
        let path = h.reconciler.local_config_path("ams");

        assert!(matches!(h.reconciler.reconcile("s1").await, Outcome::Applied));
        let first = std::fs::read(&path).unwrap();

        assert!(matches!(
            h.reconciler.reconcile("s1").await,
            Outcome::SkippedNoChange
        ));
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[tokio::test]
    async fn test_routes_do_not_accumulate() {
        let h = harness(
            vec![server("s1", "ams", SyncMode::Local)],
            vec![user("u1", Role::User), user("u2", Role::User)],
        );
        let path = h.reconciler.local_config_path("ams");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({"apps": {"http": {"servers": {
                "main": {"listen": [":443"], "routes": [{"handle": [{"handler": "file_server"}]}]},
                "relay": {"listen": [":8443"], "routes": []},
            }}}}))
            .unwrap(),
        )
        .unwrap();

        for user_id in ["u1", "u2", "u1"] {
            h.tokens.get_or_generate(user_id, "s1");
            h.reconciler.reconcile("s1").await;
        }

        let config = read_json(&path);
        assert_eq!(bridge_route_count(&config, "relay"), 2);
        assert_eq!(bridge_route_count(&config, "main"), 0);
        assert_eq!(
            config["apps"]["http"]["servers"]["main"]["routes"],
            json!([{"handle": [{"handler": "file_server"}]}])
        );
    }

    #[tokio::test]
    async fn test_new_token_extends_key_list() {
        let h = harness(
            vec![server("s1", "ams", SyncMode::Local)],
            vec![user("u1", Role::User), user("u2", Role::User)],
        );
        let path = h.reconciler.local_config_path("ams");

        let first = h.tokens.get_or_generate("u1", "s1");
        h.reconciler.reconcile("s1").await;

        let second = h.tokens.get_or_generate("u2", "s1");
        assert!(matches!(h.reconciler.reconcile("s1").await, Outcome::Applied));

        let config = read_json(&path);
        let secrets: HashSet<String> = config["apps"]["outline"]["connection_handlers"][0]
            ["handle"]["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|key| key["secret"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            secrets,
            HashSet::from([first.secret, second.secret, "technical".to_string()])
        );
    }

    #[tokio::test]
    async fn test_ineligible_users_are_left_out() {
        let mut premium = server("s1", "ams", SyncMode::Local);
        premium.premium = true;
        let mut premium_user = user("u3", Role::User);
        premium_user.premium = true;
        let h = harness(
            vec![premium],
            vec![user("u1", Role::User), user("u2", Role::Guest), premium_user],
        );
        for user_id in ["u1", "u2", "u3", "ghost"] {
            h.tokens.get_or_generate(user_id, "s1");
        }

        h.reconciler.reconcile("s1").await;
        let config = read_json(&h.reconciler.local_config_path("ams"));
        assert_eq!(key_ids(&config), set(&["u3", "service"]));
    }

    #[tokio::test]
    async fn test_malformed_file_fails_without_writing() {
        let h = harness(vec![server("s1", "ams", SyncMode::Local)], vec![]);
        let path = h.reconciler.local_config_path("ams");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{broken").unwrap();

        assert!(matches!(
            h.reconciler.reconcile("s1").await,
            Outcome::Failed(ReconcileError::Parse(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"{broken");

        std::fs::write(&path, b"{}").unwrap();
        assert!(matches!(
            h.reconciler.reconcile("s1").await,
            Outcome::Failed(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let h = harness(vec![], vec![]);
        assert!(matches!(
            h.reconciler.reconcile("nope").await,
            Outcome::Failed(ReconcileError::Registry(RegistryError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_remote_apply_then_skip() {
        let admin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/adm/config/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apps": {"http": {"servers": {"srv0": {"listen": [":443"], "routes": []}}}}
            })))
            .mount(&admin)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/adm/config/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&admin)
            .await;

        let h = harness(
            vec![server("s1", "ams", remote(format!("{}/adm", admin.uri())))],
            vec![],
        );
        assert!(matches!(h.reconciler.reconcile("s1").await, Outcome::Applied));

        let requests = admin.received_requests().await.unwrap();
        let patch = requests
            .iter()
            .find(|request| request.method.as_str() == "PATCH")
            .unwrap();
        let patched: Value = serde_json::from_slice(&patch.body).unwrap();
        assert_eq!(key_ids(&patched), set(&["service"]));
        assert_eq!(read_json(&h.reconciler.local_config_path("ams")), patched);
        admin.verify().await;

        // The admin API now serves what we sent: nothing left to do.
        admin.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(patched))
            .mount(&admin)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&admin)
            .await;
        assert!(matches!(
            h.reconciler.reconcile("s1").await,
            Outcome::SkippedNoChange
        ));
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_locally_and_spares_other_servers() {
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&broken)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apps": {"http": {"servers": {"srv0": {"listen": [":443"], "routes": []}}}}
            })))
            .mount(&healthy)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&healthy)
            .await;

        let h = harness(
            vec![
                server("s1", "ams", remote(format!("{}/adm", broken.uri()))),
                server("s2", "fra", remote(format!("{}/adm", healthy.uri()))),
            ],
            vec![],
        );

        let outcomes = h.reconciler.reconcile_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| matches!(outcome, Outcome::Applied)));

        let fallback = read_json(&h.reconciler.local_config_path("ams"));
        let routes = &fallback["apps"]["http"]["servers"]["srv0"]["routes"];
        // Two bridging routes in front of the admin route.
        assert_eq!(routes.as_array().unwrap().len(), 3);
        assert_eq!(routes[2]["terminal"], json!(true));
        assert_eq!(key_ids(&fallback), set(&["service"]));

        broken.verify().await;
        healthy.verify().await;
    }

    #[tokio::test]
    async fn test_missing_credentials_defer_until_saved() {
        let unreachable = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&unreachable)
            .await;

        let mut srv = server("s1", "ams", remote(unreachable.uri()));
        if let Some(remote) = srv.remote_mut() {
            remote.basic_auth = BasicAuth::default();
        }
        let h = harness(vec![srv], vec![]);
        let mut events = h.registry.subscribe();

        assert!(matches!(
            h.reconciler.reconcile("s1").await,
            Outcome::DeferredPendingServerSave
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::ServerUpdated("s1".into())
        );
        assert!(!h.reconciler.local_config_path("ams").exists());

        let saved = h.registry.get_server("s1").await.unwrap();
        let remote = saved.remote().unwrap();
        assert!(remote.basic_auth.is_complete());
        assert_eq!(remote.admin_endpoint.len(), 33);
    }
}
