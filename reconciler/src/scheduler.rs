use crate::debounce::{BoxFuture, Debouncer, RunFn};
use crate::reconcile::Reconciler;
use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use registry::{Registry, RegistryError, RegistryEvent, Server, ServerFilter};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use token_store::TokenStore;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    /// Cron expression for servers without their own schedule.
    pub default_schedule: String,
    /// How long [`Scheduler::shutdown`] waits for runs in progress.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            debounce: Duration::from_secs(2),
            default_schedule: "0 0 * * *".into(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Parses a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// The schedule `server` runs on: its own when it has a valid one, the
/// default otherwise.
fn effective_schedule(server: &Server, default: &str) -> Option<(String, Schedule)> {
    let own = server
        .remote()
        .and_then(|remote| remote.sync_schedule.as_deref())
        .filter(|expr| !expr.trim().is_empty());

    if let Some(expr) = own {
        match parse_schedule(expr) {
            Ok(schedule) => return Some((expr.to_string(), schedule)),
            Err(e) => tracing::warn!(
                server_id = %server.id,
                schedule = expr,
                error = %e,
                "invalid sync schedule, using the default"
            ),
        }
    }

    match parse_schedule(default) {
        Ok(schedule) => Some((default.to_string(), schedule)),
        Err(e) => {
            tracing::warn!(schedule = default, error = %e, "invalid default sync schedule");
            None
        }
    }
}

async fn cron_loop(server_id: String, schedule: Schedule, debouncer: Debouncer) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        tracing::debug!(server_id = %server_id, "scheduled reconciliation");
        if !debouncer.trigger() {
            return;
        }
    }
}

/// Per-server debounce lane plus its periodic job.
struct Lane {
    debouncer: Debouncer,
    actor: Option<JoinHandle<()>>,
    cron: Option<JoinHandle<()>>,
    schedule: Option<String>,
}

impl Lane {
    fn set_schedule(&mut self, server_id: &str, schedule: Option<(String, Schedule)>) {
        let expr = schedule.as_ref().map(|(expr, _)| expr.clone());
        if self.cron.is_some() && self.schedule == expr {
            return;
        }
        if let Some(cron) = self.cron.take() {
            cron.abort();
        }
        self.cron = schedule.map(|(_, schedule)| {
            tokio::spawn(cron_loop(
                server_id.to_string(),
                schedule,
                self.debouncer.clone(),
            ))
        });
        self.schedule = expr;
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        if let Some(cron) = self.cron.take() {
            cron.abort();
        }
    }
}

struct Inner {
    reconciler: Arc<Reconciler>,
    registry: Arc<dyn Registry>,
    tokens: TokenStore,
    config: SchedulerConfig,
    lanes: Mutex<HashMap<String, Lane>>,
    /// One per server id, outliving its lanes, so the actor of a removed
    /// lane and the actor of its replacement never run together.
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Actors of removed lanes that may still be finishing a run.
    retired: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Inner {
    fn register(&self, server: &Server) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let schedule = effective_schedule(server, &self.config.default_schedule);

        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(&server.id) {
            lane.set_schedule(&server.id, schedule);
            return;
        }

        let reconciler = self.reconciler.clone();
        let server_id = server.id.clone();
        let run_lock = self.run_locks.lock().entry(server.id.clone()).or_default().clone();
        let run: RunFn = Arc::new(move || -> BoxFuture {
            let reconciler = reconciler.clone();
            let server_id = server_id.clone();
            let run_lock = run_lock.clone();
            Box::pin(async move {
                let _running = run_lock.lock().await;
                reconciler.reconcile(&server_id).await;
            })
        });

        let (debouncer, actor) = Debouncer::spawn(self.config.debounce, run);
        let mut lane = Lane {
            debouncer,
            actor: Some(actor),
            cron: None,
            schedule: None,
        };
        lane.set_schedule(&server.id, schedule);
        lanes.insert(server.id.clone(), lane);
        tracing::info!(server_id = %server.id, slug = %server.slug, "server lane registered");
    }

    /// Closes the lane of `server_id`. A run in progress completes, nothing
    /// else is started for it.
    fn unregister(&self, server_id: &str) {
        let Some(mut lane) = self.lanes.lock().remove(server_id) else {
            return;
        };
        if let Some(actor) = lane.actor.take() {
            let mut retired = self.retired.lock();
            retired.retain(|actor| !actor.is_finished());
            retired.push(actor);
        }
        tracing::info!(server_id, "server lane removed");
    }

    fn trigger(&self, server_id: &str) -> bool {
        self.lanes
            .lock()
            .get(server_id)
            .is_some_and(|lane| lane.debouncer.trigger())
    }

    fn trigger_all(&self) {
        for lane in self.lanes.lock().values() {
            lane.debouncer.trigger();
        }
    }

    /// Brings the lane set in line with the registry and triggers every lane.
    async fn resync(&self) -> Result<(), RegistryError> {
        let servers = self.registry.list_servers(ServerFilter::Enabled).await?;
        let wanted: HashSet<&str> = servers.iter().map(|server| server.id.as_str()).collect();

        let stale: Vec<String> = self
            .lanes
            .lock()
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for server_id in stale {
            self.unregister(&server_id);
        }

        for server in &servers {
            self.register(server);
        }
        // Locks still held by an actor belong to a lane that may be running.
        self.run_locks
            .lock()
            .retain(|id, lock| wanted.contains(id.as_str()) || Arc::strong_count(lock) > 1);
        self.trigger_all();
        Ok(())
    }

    async fn on_server_changed(&self, server_id: &str) {
        match self.registry.get_server(server_id).await {
            Ok(server) if server.enabled => {
                self.register(&server);
                self.trigger(server_id);
            }
            Ok(_) => self.unregister(server_id),
            Err(RegistryError::NotFound { .. }) => self.unregister(server_id),
            Err(e) => tracing::warn!(server_id, error = %e, "could not load changed server"),
        }
    }

    async fn on_user_changed(&self, user_id: &str) {
        match self.registry.get_user(user_id).await {
            Ok(user) if !user.is_active() => {
                self.tokens.revoke_user(user_id);
            }
            Ok(_) => {}
            Err(RegistryError::NotFound { .. }) => {
                self.tokens.revoke_user(user_id);
            }
            Err(e) => tracing::warn!(user_id, error = %e, "could not load changed user"),
        }
        // Any user's eligibility may differ per server.
        self.trigger_all();
    }

    async fn handle_event(&self, event: RegistryEvent) {
        tracing::debug!(?event, "registry event");
        match event {
            RegistryEvent::ServerCreated(id) | RegistryEvent::ServerUpdated(id) => {
                self.on_server_changed(&id).await
            }
            RegistryEvent::ServerDeleted(id) => self.unregister(&id),
            RegistryEvent::UserChanged(id) => self.on_user_changed(&id).await,
            RegistryEvent::UserDeleted(id) => {
                self.tokens.revoke_user(&id);
                self.trigger_all();
            }
        }
    }
}

async fn watch_registry(inner: Weak<Inner>, mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            Ok(event) => inner.handle_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "registry events dropped, resynchronizing");
                if let Err(e) = inner.resync().await {
                    tracing::warn!(error = %e, "resynchronization failed");
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Decides when each server is reconciled.
///
/// Every enabled server gets a lane: a debounce actor that is the only path
/// to [`Reconciler::reconcile`] for that server, fed by its cron job, by
/// token store changes and by registry events.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        registry: Arc<dyn Registry>,
        tokens: TokenStore,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                reconciler,
                registry,
                tokens,
                config,
                lanes: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a lane for every enabled server, triggers each once and
    /// starts following token and registry changes. Call once.
    pub async fn start(&self) -> Result<(), RegistryError> {
        let events = self.inner.registry.subscribe();

        let weak = Arc::downgrade(&self.inner);
        self.inner.tokens.subscribe_on_change(move |server_id| {
            if let Some(inner) = weak.upgrade() {
                inner.trigger(server_id);
            }
        });

        self.inner.resync().await?;

        let watcher = tokio::spawn(watch_registry(Arc::downgrade(&self.inner), events));
        *self.inner.watcher.lock() = Some(watcher);

        tracing::info!(servers = self.lane_count(), "scheduler started");
        Ok(())
    }

    /// Requests a reconciliation of `server_id`. False if it has no lane.
    pub fn trigger(&self, server_id: &str) -> bool {
        self.inner.trigger(server_id)
    }

    pub fn trigger_all(&self) {
        self.inner.trigger_all();
    }

    pub fn lane_count(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    pub fn has_lane(&self, server_id: &str) -> bool {
        self.inner.lanes.lock().contains_key(server_id)
    }

    /// Stops scheduling and waits, up to the configured grace period, for
    /// runs already in progress. Pending trailing runs are dropped.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let lanes = std::mem::take(&mut *self.inner.lanes.lock());
        let servers = lanes.len();
        let mut actors = std::mem::take(&mut *self.inner.retired.lock());
        for (_, mut lane) in lanes {
            actors.extend(lane.actor.take());
        }

        let drained = tokio::time::timeout(self.inner.config.shutdown_grace, async {
            for actor in actors {
                let _ = actor.await;
            }
        })
        .await;
        match drained {
            Ok(()) => tracing::info!(servers, "scheduler stopped"),
            Err(_) => tracing::warn!(
                servers,
                grace_secs = self.inner.config.shutdown_grace.as_secs(),
                "scheduler stopped with runs still in progress"
            ),
        }
    }
}
