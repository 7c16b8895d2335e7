use crate::config::Config;
use connect::ConnectState;
use reconciler::remote::{AdminClient, RemoteError};
use reconciler::{Outcome, Reconciler, Scheduler};
use registry::{LocalRegistry, Registry, RegistryError};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use token_store::TokenStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("could not build admin API client: {0}")]
    AdminClient(#[from] RemoteError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} listener stopped unexpectedly")]
    ListenerStopped(&'static str),
}

/// Everything a running process shares, built once at startup.
pub struct AppContext {
    pub registry: Arc<dyn Registry>,
    pub tokens: TokenStore,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Scheduler,
    cipher: String,
}

impl AppContext {
    pub async fn build(config: &Config) -> Result<Self, AppError> {
        let registry: Arc<dyn Registry> = Arc::new(LocalRegistry::load(&config.registry.path).await?);
        let tokens = TokenStore::new(config.token_store_config());
        let admin = AdminClient::new(config.remote_timeout(), config.remote.retries)?;
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            tokens.clone(),
            admin,
            config.reconciler_config(),
        ));
        let scheduler = Scheduler::new(
            reconciler.clone(),
            registry.clone(),
            tokens.clone(),
            config.scheduler_config(),
        );

        Ok(AppContext {
            registry,
            tokens,
            reconciler,
            scheduler,
            cipher: config.relay.cipher.clone(),
        })
    }

    /// One reconciliation pass over `server_id`, or over every enabled
    /// server. Returns false if any pass failed.
    pub async fn reconcile_once(&self, server_id: Option<&str>) -> bool {
        let outcomes = match server_id {
            Some(id) => vec![(id.to_string(), self.reconciler.reconcile(id).await)],
            None => self.reconciler.reconcile_all().await,
        };

        let mut ok = true;
        for (server_id, outcome) in &outcomes {
            tracing::info!(server_id = %server_id, outcome = outcome.as_str(), "reconciled");
            ok &= !matches!(outcome, Outcome::Failed(_));
        }
        ok
    }

    /// Serves the connect API and the admin listener and keeps every server
    /// reconciled until ctrl-c. Reconciliations in progress are allowed to
    /// finish before returning.
    pub async fn run(self, config: &Config) -> Result<(), AppError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ready = Arc::new(AtomicBool::new(false));

        let admin_task: JoinHandle<std::io::Result<()>> = {
            let listener = config.admin_listener.clone();
            let ready = ready.clone();
            let service = AdminService::new(move || ready.load(Ordering::Relaxed));
            let shutdown = wait_for_stop(stop_rx.clone());
            tokio::spawn(async move {
                run_http_service(&listener.host, listener.port, service, shutdown).await
            })
        };

        let connect_task: JoinHandle<std::io::Result<()>> = {
            let addr = config.listener.addr();
            let state = ConnectState::new(self.registry.clone(), self.tokens.clone(), &self.cipher);
            let shutdown = wait_for_stop(stop_rx.clone());
            tokio::spawn(async move { connect::serve(&addr, state, shutdown).await })
        };

        self.scheduler.start().await?;
        ready.store(true, Ordering::Relaxed);
        tracing::info!("outline-sync ready");

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                signal.map_err(AppError::from)
            }
            res = wait_listener(admin_task, "admin") => res,
            res = wait_listener(connect_task, "connect") => res,
        };

        ready.store(false, Ordering::Relaxed);
        self.scheduler.shutdown().await;
        let _ = stop_tx.send(true);
        result
    }
}

async fn wait_for_stop(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Resolves when a listener task ends before shutdown was requested, which
/// is always an error.
async fn wait_listener(
    task: JoinHandle<std::io::Result<()>>,
    name: &'static str,
) -> Result<(), AppError> {
    match task.await {
        Ok(Ok(())) => Err(AppError::ListenerStopped(name)),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(AppError::Io(std::io::Error::other(e))),
    }
}
