//! Keeps each relay server's proxy configuration in line with its access keys.
//!
//! [`Reconciler`] runs one fetch/diff/persist pass for a server. [`Scheduler`]
//! decides when those passes happen: one debounced lane per server, fed by
//! cron schedules, token changes and registry events.

pub mod caddy;
mod debounce;
pub mod document;
pub mod metrics_defs;
mod reconcile;
pub mod remote;
mod scheduler;
pub mod sync;

pub use debounce::{BoxFuture, Debouncer, RunFn};
pub use reconcile::{Outcome, ReconcileError, Reconciler, ReconcilerConfig};
pub use scheduler::{Scheduler, SchedulerConfig, parse_schedule};
