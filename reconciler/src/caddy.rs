//! Edits of a Caddy configuration document: bridging routes, the outline
//! app holding the access keys, and scaffolds for servers without one.

use crate::document::{ConfigDocument, DocumentError};
use registry::domains::route_domains;
use registry::{AppSettings, Server, Transport};
use serde_json::{Value, json};
use std::collections::HashSet;
use thiserror::Error;

/// Handler name that marks a route as injected by us.
pub const BRIDGE_HANDLER: &str = "websocket2layer4";

const SERVERS_PATH: [&str; 3] = ["apps", "http", "servers"];
const KEYS_PATH: [&str; 6] = ["apps", "outline", "connection_handlers", "0", "handle", "keys"];
const OUTLINE_PATH: [&str; 2] = ["apps", "outline"];

const REPLAY_HISTORY: u64 = 10_000;

#[derive(Error, Debug)]
pub enum CaddyError {
    #[error("path apps.http.servers not found")]
    ServersMissing,

    #[error("no servers defined under apps.http.servers")]
    NoServers,

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// One access key as written to the outline app.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutlineKey {
    pub id: String,
    pub secret: String,
    pub cipher: String,
}

impl OutlineKey {
    fn to_value(&self) -> Value {
        json!({"cipher": self.cipher, "id": self.id, "secret": self.secret})
    }
}

/// Whether the key list in `doc` differs from `desired`, compared as sets of
/// `(secret, id, cipher)`. A missing or malformed key list counts as changed.
pub fn keys_changed(doc: &ConfigDocument, desired: &[OutlineKey]) -> bool {
    let Some(Value::Array(current)) = doc.get_at(&KEYS_PATH) else {
        return true;
    };

    let mut existing = HashSet::with_capacity(current.len());
    for entry in current {
        let Value::Object(entry) = entry else {
            return true;
        };
        let field = |name: &str| {
            entry
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        existing.insert(OutlineKey {
            id: field("id"),
            secret: field("secret"),
            cipher: field("cipher"),
        });
    }

    let wanted: HashSet<OutlineKey> = desired.iter().cloned().collect();
    existing != wanted
}

fn is_bridge_route(route: &Value) -> bool {
    route
        .get("handle")
        .and_then(Value::as_array)
        .is_some_and(|handles| {
            handles
                .iter()
                .any(|h| h.get("handler").and_then(Value::as_str) == Some(BRIDGE_HANDLER))
        })
}

/// Removes every previously injected bridging route from every server block.
/// Returns the number of removed routes.
pub fn strip_bridge_routes(doc: &mut ConfigDocument) -> Result<usize, CaddyError> {
    let names: Vec<String> = doc
        .object_at(&SERVERS_PATH)
        .ok_or(CaddyError::ServersMissing)?
        .keys()
        .cloned()
        .collect();

    let mut removed = 0;
    for name in names {
        let path = ["apps", "http", "servers", name.as_str(), "routes"];
        if !matches!(doc.get_at(&path), Some(Value::Array(_))) {
            continue;
        }
        removed += doc.filter_array_at(&path, |route| !is_bridge_route(route))?;
    }
    Ok(removed)
}

fn listens_on(block: &Value, port: u16) -> bool {
    let suffixes = [
        format!(":{port}"),
        format!(":{port}/tcp"),
        format!(":{port}/udp"),
    ];
    block
        .get("listen")
        .and_then(Value::as_array)
        .is_some_and(|listen| {
            listen
                .iter()
                .filter_map(Value::as_str)
                .any(|addr| suffixes.iter().any(|suffix| addr.ends_with(suffix.as_str())))
        })
}

/// Picks the server block the bridging routes go into.
///
/// Tries the server's TCP and UDP ports, then 80 and 443, scanning blocks in
/// key order. Falls back to the first key.
pub fn find_server_key(doc: &ConfigDocument, server: &Server) -> Result<String, CaddyError> {
    let blocks = doc
        .object_at(&SERVERS_PATH)
        .ok_or(CaddyError::ServersMissing)?;

    let mut names: Vec<&String> = blocks.keys().collect();
    names.sort();

    let ports = [server.transports.tcp.port, server.transports.udp.port, 80, 443];
    for port in ports.into_iter().filter(|port| *port != 0) {
        if let Some(name) = names.iter().find(|name| listens_on(&blocks[name.as_str()], port)) {
            return Ok(name.to_string());
        }
    }

    names
        .first()
        .map(|name| name.to_string())
        .ok_or(CaddyError::NoServers)
}

/// The TCP (stream) and UDP (packet) bridging routes for `server`.
pub fn bridge_routes(server: &Server, settings: &AppSettings) -> Vec<Value> {
    let hosts = route_domains(server, settings);
    Transport::ALL
        .iter()
        .map(|transport| {
            let kind = match transport {
                Transport::Tcp => "stream",
                Transport::Udp => "packet",
            };
            let path = format!(
                "/{}",
                server.transports.get(*transport).path.trim_matches('/')
            );
            json!({
                "handle": [{
                    "connection_handler": server.slug,
                    "handler": BRIDGE_HANDLER,
                    "type": kind,
                }],
                "match": [
                    {"host": hosts},
                    {"path": [path]},
                ],
            })
        })
        .collect()
}

/// Prepends fresh bridging routes to the block `server_key`.
pub fn inject_bridge_routes(
    doc: &mut ConfigDocument,
    server_key: &str,
    server: &Server,
    settings: &AppSettings,
) -> Result<(), CaddyError> {
    let path = ["apps", "http", "servers", server_key, "routes"];
    doc.prepend_array_at(&path, bridge_routes(server, settings))?;
    Ok(())
}

/// The `apps.outline` section serving `keys` under the server's slug.
pub fn outline_app(slug: &str, keys: &[OutlineKey]) -> Value {
    json!({
        "shadowsocks": {"replay_history": REPLAY_HISTORY},
        "connection_handlers": [{
            "name": slug,
            "handle": {
                "handler": "shadowsocks",
                "keys": keys.iter().map(OutlineKey::to_value).collect::<Vec<_>>(),
            },
        }],
    })
}

pub fn set_outline_app(
    doc: &mut ConfigDocument,
    slug: &str,
    keys: &[OutlineKey],
) -> Result<(), CaddyError> {
    doc.set_at(&OUTLINE_PATH, outline_app(slug, keys))?;
    Ok(())
}

/// Process-level locations baked into generated scaffolds.
#[derive(Clone, Debug)]
pub struct ScaffoldOptions {
    /// Where the generated proxy exposes its own admin API.
    pub admin_socket: String,
    /// Root of the proxy's certificate storage.
    pub storage_root: String,
    /// Upstream the admin route of a remote server proxies to.
    pub admin_upstream: String,
}

impl Default for ScaffoldOptions {
    fn default() -> Self {
        ScaffoldOptions {
            admin_socket: "unix//outline_generated/admin.sock".into(),
            storage_root: "/config".into(),
            admin_upstream: "unix//var/run/caddy/admin.sock".into(),
        }
    }
}

fn listen_addresses(server: &Server) -> Vec<String> {
    let mut ports = vec![443, 80];
    for port in server.transports.ports() {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports.into_iter().map(|port| format!(":{port}")).collect()
}

/// Minimal document for a locally synced server: listeners, no routes.
pub fn local_scaffold(server: &Server, options: &ScaffoldOptions) -> ConfigDocument {
    ConfigDocument::from(json!({
        "admin": {"listen": options.admin_socket},
        "storage": {"module": "file_system", "root": options.storage_root},
        "apps": {
            "http": {
                "servers": {
                    "srv0": {"listen": listen_addresses(server), "routes": []}
                }
            },
            "tls": {"automation": {"on_demand": {}}},
        },
    }))
}

/// Minimal document for a remote server: one terminal route exposing the
/// proxy's admin API under `admin_path`, behind basic auth.
pub fn remote_scaffold(
    server: &Server,
    settings: &AppSettings,
    options: &ScaffoldOptions,
    admin_path: &str,
    username: &str,
    password_hash: &str,
) -> ConfigDocument {
    let admin_proxy = json!({
        "handle": [{
            "handler": "subroute",
            "routes": [
                {"handle": [{"handler": "rewrite", "strip_path_prefix": admin_path}]},
                {"handle": [
                    {
                        "handler": "authentication",
                        "providers": {
                            "http_basic": {
                                "accounts": [{"username": username, "password": password_hash}],
                                "hash": {"algorithm": "bcrypt"},
                                "hash_cache": {},
                            }
                        },
                    },
                    {
                        "handler": "reverse_proxy",
                        "upstreams": [{"dial": options.admin_upstream}],
                    },
                ]},
            ],
        }],
        "match": [{"path": [format!("{admin_path}/*")]}],
    });

    ConfigDocument::from(json!({
        "admin": {"listen": options.admin_socket},
        "storage": {"module": "file_system", "root": options.storage_root},
        "apps": {
            "http": {
                "servers": {
                    "srv0": {
                        "listen": listen_addresses(server),
                        "routes": [{
                            "match": [{"host": route_domains(server, settings)}],
                            "handle": [{"handler": "subroute", "routes": [admin_proxy]}],
                            "terminal": true,
                        }],
                    }
                }
            }
        },
    }))
}
