//! Server and user definitions consumed by the reconciliation core.
//!
//! The [`Registry`] trait is the seam to whatever persists these records. The
//! crate ships [`LocalRegistry`], an in-memory store that can be backed by a
//! YAML file and that broadcasts a [`RegistryEvent`] for every mutation.

pub mod domains;
pub mod local;
pub mod models;
mod registry;

pub use local::{LocalRegistry, RegistryData};
pub use models::{
    AppSettings, BasicAuth, Protocol, RemoteSync, Role, Server, SyncMode, Transport, Transports,
    User, ValidationError,
};
pub use registry::{Registry, RegistryError, RegistryEvent, ServerFilter};
