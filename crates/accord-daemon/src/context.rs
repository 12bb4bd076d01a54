//! Shared state injected into every worker.

use std::sync::Arc;

use accord_core::config::Config;
use accord_core::persistence::Store;
use accord_core::policy::manager::PolicyManager;
use accord_core::protocol::signing::PartyKey;

use crate::anchor::AnchorWriter;
use crate::exchange::Directory;
use crate::keycache::KeyCache;
use crate::runtime::MessageBus;

/// The process-wide collaborators, handed to each worker at construction.
///
/// Tests substitute fakes for the directory and the anchor; everything
/// else is real.
#[derive(Clone)]
pub struct WorkerContext {
    /// Daemon configuration.
    pub config: Arc<Config>,
    /// The embedded store.
    pub store: Arc<Store>,
    /// The shared policy registry.
    pub policies: Arc<PolicyManager>,
    /// Directory client.
    pub directory: Arc<dyn Directory>,
    /// Anchor writer with bounded retries.
    pub anchor: Arc<AnchorWriter>,
    /// The event bus.
    pub bus: Arc<MessageBus>,
    /// Remote mailbox key cache.
    pub keys: Arc<KeyCache>,
    /// This party's key material.
    pub identity: Arc<PartyKey>,
}
