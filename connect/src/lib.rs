//! Public endpoint handing users the transport parameters of a relay server.
//!
//! Clients fetch `GET /api/outline/{user_id}/{secret}` and receive a YAML
//! document describing a TCP and a UDP shadowsocks-over-websocket transport.
//! Asking for it is what issues (or renews) the user's access key on the
//! chosen server.

mod api;
pub mod metrics_defs;
mod transport;

pub use api::{ConnectError, ConnectState, router, serve};
pub use transport::{ConnectDocument, decode_prefix, websocket_url};
