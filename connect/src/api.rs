use crate::metrics_defs::CONNECT_REQUESTS;
use crate::transport::ConnectDocument;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use registry::domains::connect_domain;
use registry::{Registry, RegistryError, Server, ServerFilter, User};
use serde::Serialize;
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use token_store::TokenStore;
use tokio::net::TcpListener;

const YAML_CONTENT_TYPE: &str = "application/x-yaml";
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Characters escaped in the path segments and fragment of the redirect URL.
const FRAGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("user not found")]
    UserNotFound,

    #[error("connect secret does not match")]
    InvalidSecret,

    #[error("guest access denied")]
    GuestDenied,

    #[error("failed to list servers: {0}")]
    Servers(RegistryError),

    #[error("no eligible server")]
    NoServers,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to render transport config: {0}")]
    Render(#[from] serde_yaml::Error),
}

impl ConnectError {
    fn kind(&self) -> &'static str {
        match self {
            ConnectError::UserNotFound => "user_not_found",
            ConnectError::InvalidSecret => "invalid_secret",
            ConnectError::GuestDenied => "guest",
            ConnectError::Servers(_) => "servers_unavailable",
            ConnectError::NoServers => "no_servers",
            ConnectError::Registry(_) => "registry",
            ConnectError::Render(_) => "render",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ConnectError::UserNotFound => "User not found",
            ConnectError::InvalidSecret => "Invalid Outline Secret",
            ConnectError::GuestDenied => "Guest Access Denied",
            ConnectError::Servers(_) | ConnectError::Registry(_) => {
                "Failed to retrieve Outline servers"
            }
            ConnectError::NoServers => "No Active Outline Servers",
            ConnectError::Render(_) => "Config Generation Error",
        }
    }

    fn details(&self) -> &'static str {
        match self {
            ConnectError::UserNotFound => "The user with the specified ID does not exist.",
            ConnectError::InvalidSecret => {
                "The provided Outline secret is invalid or does not match the user's secret."
            }
            ConnectError::GuestDenied => "Guests are not allowed to connect to Outline.",
            ConnectError::Servers(_) | ConnectError::Registry(_) => {
                "An error occurred while trying to retrieve the list of active Outline servers."
            }
            ConnectError::NoServers => {
                "There are currently no active Outline servers available for connection."
            }
            ConnectError::Render(_) => {
                "An error occurred while generating the Outline configuration."
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Serialize)]
struct ErrorDetails {
    message: &'static str,
    details: &'static str,
}

/// Clients only parse 200 responses, so errors are reported in the body.
impl IntoResponse for ConnectError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "connect request rejected");
        counter!(CONNECT_REQUESTS, "outcome" => self.kind()).increment(1);

        let body = ErrorBody {
            error: ErrorDetails {
                message: self.message(),
                details: self.details(),
            },
        };
        match serde_yaml::to_string(&body) {
            Ok(yaml) => yaml_response(yaml),
            Err(e) => {
                tracing::error!(error = %e, "failed to render error body");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn yaml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(YAML_CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE)),
        ],
        body,
    )
        .into_response()
}

#[derive(Clone)]
pub struct ConnectState {
    registry: Arc<dyn Registry>,
    tokens: TokenStore,
    cipher: String,
}

impl ConnectState {
    pub fn new(registry: Arc<dyn Registry>, tokens: TokenStore, cipher: impl Into<String>) -> Self {
        ConnectState {
            registry,
            tokens,
            cipher: cipher.into(),
        }
    }

    async fn authorize(&self, user_id: &str, secret: &str) -> Result<User, ConnectError> {
        let user = match self.registry.get_user(user_id).await {
            Ok(user) => user,
            Err(RegistryError::NotFound { .. }) => return Err(ConnectError::UserNotFound),
            Err(e) => return Err(e.into()),
        };
        if user.secret.is_empty() || user.secret != secret {
            return Err(ConnectError::InvalidSecret);
        }
        if !user.is_active() {
            return Err(ConnectError::GuestDenied);
        }
        Ok(user)
    }

    /// The user's preferred server when they may use it, otherwise a random
    /// eligible one.
    async fn pick_server(&self, user: &User) -> Result<Server, ConnectError> {
        let servers = self
            .registry
            .list_servers(ServerFilter::Enabled)
            .await
            .map_err(ConnectError::Servers)?;
        let mut eligible: Vec<Server> = servers.into_iter().filter(|s| user.can_use(s)).collect();

        if let Some(preferred) = user.preferred_server.as_deref() {
            if let Some(pos) = eligible.iter().position(|s| s.id == preferred) {
                return Ok(eligible.swap_remove(pos));
            }
        }

        if eligible.is_empty() {
            return Err(ConnectError::NoServers);
        }
        let index = rand::thread_rng().gen_range(0..eligible.len());
        Ok(eligible.swap_remove(index))
    }
}

pub fn router(state: ConnectState) -> Router {
    Router::new()
        .route("/api/outline/{user_id}/{secret}", get(connect))
        .route("/api/outline/redirect/{user_id}/{secret}", get(redirect))
        .with_state(state)
}

/// Serves the connect API on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: &str, state: ConnectState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "connect API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn connect(
    State(state): State<ConnectState>,
    Path((user_id, secret)): Path<(String, String)>,
) -> Result<Response, ConnectError> {
    let user = state.authorize(&user_id, &secret).await?;
    let server = state.pick_server(&user).await?;
    let settings = state.registry.settings().await?;

    let token = state.tokens.get_or_generate(&user.id, &server.id);
    let domain = connect_domain(&server, &user, &settings);
    let doc = ConnectDocument::build(&server, &user, &domain, &state.cipher, &token.secret);
    let yaml = doc.to_yaml()?;

    tracing::info!(user_id = %user.id, server_id = %server.id, "transport config served");
    counter!(CONNECT_REQUESTS, "outcome" => "served").increment(1);
    Ok(yaml_response(yaml))
}

async fn redirect(
    State(state): State<ConnectState>,
    Path((user_id, secret)): Path<(String, String)>,
) -> Result<Response, ConnectError> {
    let settings = state.registry.settings().await?;
    let location = format!(
        "ssconf://{}/api/outline/{}/{}#{}",
        settings.app_domain,
        utf8_percent_encode(&user_id, FRAGMENT),
        utf8_percent_encode(&secret, FRAGMENT),
        utf8_percent_encode(&settings.app_title, FRAGMENT),
    );
    let location = HeaderValue::from_str(&location).map_err(|_| ConnectError::InvalidSecret)?;
    Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response())
}
