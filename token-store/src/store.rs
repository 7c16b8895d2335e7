use crate::metrics_defs::{TOKEN_STORE_EXPIRED, TOKEN_STORE_ISSUED, TOKEN_STORE_SIZE};
use parking_lot::RwLock;
use shared::secret::random_secret;
use shared::{counter, gauge};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct TokenStoreConfig {
    /// Expiry measured from the last use; renewed on every access.
    pub sliding_ttl: Duration,
    /// Expiry measured from creation; never renewed.
    pub absolute_ttl: Duration,
    pub sweep_interval: Duration,
    /// Name and secret of the key appended to every server's key set.
    pub technical_key_name: String,
    pub technical_key_secret: String,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        TokenStoreConfig {
            sliding_ttl: Duration::from_secs(4 * 3600),
            absolute_ttl: Duration::from_secs(48 * 3600),
            sweep_interval: Duration::from_secs(8 * 3600),
            technical_key_name: "service".into(),
            technical_key_secret: random_secret(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessToken {
    pub server_id: String,
    pub user_id: String,
    pub secret: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl AccessToken {
    fn new(server_id: &str, user_id: &str, secret: String, now: Instant) -> Self {
        AccessToken {
            server_id: server_id.to_string(),
            user_id: user_id.to_string(),
            secret,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn is_valid(&self, now: Instant, config: &TokenStoreConfig) -> bool {
        now.saturating_duration_since(self.created_at) <= config.absolute_ttl
            && now.saturating_duration_since(self.last_used_at) <= config.sliding_ttl
    }
}

/// Called with the id of a server whose key set changed.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

// server_id -> user_id -> token
type TokenMap = HashMap<String, HashMap<String, AccessToken>>;

struct Inner {
    config: TokenStoreConfig,
    tokens: RwLock<TokenMap>,
    listeners: Arc<RwLock<Vec<ChangeListener>>>,
    notify_tx: mpsc::UnboundedSender<String>,
}

impl Inner {
    fn notify(&self, server_id: &str) {
        // The dispatcher only stops once every sender is gone.
        let _ = self.notify_tx.send(server_id.to_string());
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut affected = BTreeSet::new();
        let mut removed = 0;

        {
            let mut tokens = self.tokens.write();
            for (server_id, by_user) in tokens.iter_mut() {
                let before = by_user.len();
                by_user.retain(|_, token| token.is_valid(now, &self.config));
                if by_user.len() != before {
                    removed += before - by_user.len();
                    affected.insert(server_id.clone());
                }
            }
            tokens.retain(|_, by_user| !by_user.is_empty());
            gauge!(TOKEN_STORE_SIZE).set(total(&tokens) as f64);
        }

        if removed > 0 {
            tracing::info!(removed, servers = affected.len(), "expired access tokens swept");
            counter!(TOKEN_STORE_EXPIRED).increment(removed as u64);
        }
        for server_id in &affected {
            self.notify(server_id);
        }
        removed
    }
}

fn total(tokens: &TokenMap) -> usize {
    tokens.values().map(HashMap::len).sum()
}

/// Concurrency-safe map of `(server, user) -> AccessToken`.
///
/// Every change to a server's key set is reported to the subscribed listeners
/// from a dispatcher task, after the store's lock has been released. A sweep
/// task removes expired tokens every `sweep_interval` and reports each
/// affected server once per pass. Both tasks end when the last handle is
/// dropped.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl TokenStore {
    /// Must be called from within a tokio runtime.
    pub fn new(config: TokenStoreConfig) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let listeners: Arc<RwLock<Vec<ChangeListener>>> = Arc::default();

        tokio::spawn(dispatch(notify_rx, listeners.clone()));

        let sweep_interval = config.sweep_interval;
        let inner = Arc::new(Inner {
            config,
            tokens: RwLock::new(HashMap::new()),
            listeners,
            notify_tx,
        });

        tokio::spawn(sweep_loop(Arc::downgrade(&inner), sweep_interval));

        TokenStore { inner }
    }

    pub fn config(&self) -> &TokenStoreConfig {
        &self.inner.config
    }

    /// Returns the valid token for `(server_id, user_id)`, refreshing its last
    /// use, or issues a new one when none exists or the old one expired.
    pub fn get_or_generate(&self, user_id: &str, server_id: &str) -> AccessToken {
        let now = Instant::now();
        let config = &self.inner.config;

        let token = {
            let mut tokens = self.inner.tokens.write();
            let by_user = tokens.entry(server_id.to_string()).or_default();

            if let Some(token) = by_user.get_mut(user_id) {
                if token.is_valid(now, config) {
                    token.last_used_at = now;
                    return token.clone();
                }
            }

            let mut secret = random_secret();
            while secret == config.technical_key_secret
                || by_user.values().any(|token| token.secret == secret)
            {
                secret = random_secret();
            }

            let token = AccessToken::new(server_id, user_id, secret, now);
            by_user.insert(user_id.to_string(), token.clone());
            gauge!(TOKEN_STORE_SIZE).set(total(&tokens) as f64);
            token
        };

        tracing::debug!(server_id, user_id, "access token issued");
        counter!(TOKEN_STORE_ISSUED).increment(1);
        self.inner.notify(server_id);
        token
    }

    /// Valid tokens of `server_id` followed by the technical token.
    pub fn get_all_by_server(&self, server_id: &str) -> Vec<AccessToken> {
        let now = Instant::now();
        let config = &self.inner.config;

        let mut result: Vec<AccessToken> = self
            .inner
            .tokens
            .read()
            .get(server_id)
            .map(|by_user| {
                by_user
                    .values()
                    .filter(|token| token.is_valid(now, config))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        result.push(self.technical_token(server_id));
        result
    }

    /// The non-expiring key every server carries.
    pub fn technical_token(&self, server_id: &str) -> AccessToken {
        let config = &self.inner.config;
        AccessToken::new(
            server_id,
            &config.technical_key_name,
            config.technical_key_secret.clone(),
            Instant::now(),
        )
    }

    pub fn is_technical(&self, token: &AccessToken) -> bool {
        token.user_id == self.inner.config.technical_key_name
            && token.secret == self.inner.config.technical_key_secret
    }

    /// Drops every token of `user_id`. Returns the affected server ids.
    pub fn revoke_user(&self, user_id: &str) -> Vec<String> {
        let affected: Vec<String> = {
            let mut tokens = self.inner.tokens.write();
            let affected = tokens
                .iter_mut()
                .filter_map(|(server_id, by_user)| {
                    by_user.remove(user_id).map(|_| server_id.clone())
                })
                .collect();
            tokens.retain(|_, by_user| !by_user.is_empty());
            gauge!(TOKEN_STORE_SIZE).set(total(&tokens) as f64);
            affected
        };

        if !affected.is_empty() {
            tracing::info!(user_id, servers = affected.len(), "access tokens revoked");
        }
        for server_id in &affected {
            self.inner.notify(server_id);
        }
        affected
    }

    /// One sweep pass. Returns the number of removed tokens.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Registers `listener` for key set changes. Listeners run on the
    /// dispatcher task and should hand work off rather than block.
    pub fn subscribe_on_change<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    pub fn len(&self) -> usize {
        total(&self.inner.tokens.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<String>,
    listeners: Arc<RwLock<Vec<ChangeListener>>>,
) {
    while let Some(server_id) = rx.recv().await {
        let current = listeners.read().clone();
        for listener in current {
            listener(&server_id);
        }
    }
}

async fn sweep_loop(inner: Weak<Inner>, every: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.sweep_expired();
    }
}
