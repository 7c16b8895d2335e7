//! Values derived from a server definition and the application settings.

use crate::models::{AppSettings, Server, User};
use url::Url;

/// The domain a server is reachable on: the override when set, otherwise
/// `{slug}.{app_domain}`.
pub fn public_domain(server: &Server, settings: &AppSettings) -> String {
    match server.override_domain.as_deref() {
        Some(domain) if !domain.is_empty() => domain.to_string(),
        _ => format!("{}.{}", server.slug, settings.app_domain),
    }
}

/// Secondary domain under the reverse app domain, when one is configured.
pub fn reverse_domain(server: &Server, settings: &AppSettings) -> Option<String> {
    settings
        .app_domain_reverse
        .as_deref()
        .filter(|domain| !domain.is_empty())
        .map(|domain| format!("{}.{}", server.slug, domain))
}

/// Every domain the bridging routes of `server` must answer on.
pub fn route_domains(server: &Server, settings: &AppSettings) -> Vec<String> {
    let mut domains = vec![public_domain(server, settings)];
    if let Some(reverse) = reverse_domain(server, settings) {
        if !domains.contains(&reverse) {
            domains.push(reverse);
        }
    }
    domains
}

/// The domain handed to `user` in their transport config.
///
/// Users that opted into the reverse server get the reverse domain when one
/// exists. A bare override name (no dot) is qualified with the app domain.
pub fn connect_domain(server: &Server, user: &User, settings: &AppSettings) -> String {
    if user.reverse_server_enabled {
        if let Some(reverse) = reverse_domain(server, settings) {
            return reverse;
        }
    }

    match server.override_domain.as_deref() {
        Some(domain) if !domain.is_empty() && !domain.contains('.') => {
            format!("{}.{}", domain, settings.app_domain)
        }
        Some(domain) if !domain.is_empty() => domain.to_string(),
        _ => format!("{}.{}", server.slug, settings.app_domain),
    }
}

/// URL of `command` on the server's admin API. `None` for local servers.
///
/// A full `http(s)://` endpoint is used as is; a bare path is mounted on
/// `https://{public_domain}`.
pub fn admin_url(server: &Server, settings: &AppSettings, command: &str) -> Option<String> {
    let remote = server.remote()?;

    let mut endpoint = remote.admin_endpoint.trim().to_string();
    if endpoint.is_empty() {
        endpoint = "/".into();
    }

    if !is_full_url(&endpoint) {
        endpoint = format!(
            "https://{}{}",
            public_domain(server, settings),
            endpoint.trim_end_matches('/')
        );
    }

    Some(format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        command.trim_start_matches('/')
    ))
}

/// Normalised path of an endpoint that may be a full URL or a bare path.
/// Always starts with `/`, never ends with one unless it is the root.
pub fn extract_url_path(raw: &str) -> String {
    let candidate = if is_full_url(raw) {
        raw.to_string()
    } else {
        format!("http://placeholder/{}", raw.trim_start_matches('/'))
    };

    let Ok(parsed) = Url::parse(&candidate) else {
        return "/".into();
    };

    let path = parsed.path().trim_end_matches('/');
    if path.is_empty() {
        "/".into()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn is_full_url(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}
