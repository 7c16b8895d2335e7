//! Per-server access keys with sliding and absolute expiry.

pub mod metrics_defs;
mod store;

pub use store::{AccessToken, ChangeListener, TokenStore, TokenStoreConfig};
