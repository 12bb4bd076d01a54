//! # accord-daemon
//!
//! The accord worker collective: the consumer worker ("agbot"), the
//! producer worker ("node"), the governance loop, the anchor subscriber,
//! the typed event bus they communicate over, the directory client, and
//! the local node-configuration REST API.
//!
//! Workers are synchronous threads, each single-threaded internally; the
//! only async island is the axum API server, which runs on its own
//! runtime thread.

pub mod agbot;
pub mod anchor;
pub mod api;
pub mod context;
pub mod exchange;
pub mod governance;
pub mod keycache;
pub mod mailbox;
pub mod node;
pub mod runtime;

/// Seconds since the Unix epoch, the timestamp form persisted in records.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
