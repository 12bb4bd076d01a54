//! TTL'd cache of remote parties' mailbox public keys.
//!
//! Every sealed message needs the recipient's published key. Keys change
//! rarely, so lookups are cached with a TTL; a miss triggers one directory
//! fetch with single-flight coalescing per id, so concurrent workers
//! asking for the same key wait for the one in-flight fetch instead of
//! stampeding the directory.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::exchange::types::split_party_id;
use crate::exchange::{Directory, DirectoryError, PartyKind};

/// Errors from key lookups.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyCacheError {
    /// The directory call failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The party exists but has not published a key.
    #[error("party {party} has no published mailbox key")]
    NoKey {
        /// Full party id.
        party: String,
    },

    /// The published key is not 32 bytes of hex.
    #[error("party {party} published a malformed mailbox key")]
    BadKey {
        /// Full party id.
        party: String,
    },
}

enum Entry {
    /// Someone is fetching; waiters block on the condvar.
    Fetching,
    /// A cached key with its fetch time.
    Ready {
        key: [u8; 32],
        fetched_at: Instant,
    },
}

/// The cache.
pub struct KeyCache {
    directory: Arc<dyn Directory>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    cond: Condvar,
}

impl KeyCache {
    /// Creates a cache over a directory client.
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, ttl: Duration) -> Self {
        Self {
            directory,
            ttl,
            entries: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Returns the mailbox key for a party, fetching on miss or expiry.
    ///
    /// # Errors
    ///
    /// [`KeyCacheError`] when the fetch fails or the published key is
    /// unusable.
    pub fn mailbox_key(&self, party: &str, kind: PartyKind) -> Result<[u8; 32], KeyCacheError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            match entries.get(party) {
                Some(Entry::Ready { key, fetched_at }) if fetched_at.elapsed() < self.ttl => {
                    return Ok(*key);
                }
                Some(Entry::Fetching) => {
                    // Another caller is already on it.
                    entries = self
                        .cond
                        .wait(entries)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                _ => break,
            }
        }
        entries.insert(party.to_string(), Entry::Fetching);
        drop(entries);

        let result = self.fetch(party, kind);

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &result {
            Ok(key) => {
                entries.insert(
                    party.to_string(),
                    Entry::Ready {
                        key: *key,
                        fetched_at: Instant::now(),
                    },
                );
            }
            Err(_) => {
                // Let the next caller retry rather than caching failure.
                entries.remove(party);
            }
        }
        self.cond.notify_all();
        result
    }

    /// Drops a cached key, forcing a refresh on next use.
    pub fn invalidate(&self, party: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(party);
        self.cond.notify_all();
    }

    fn fetch(&self, party: &str, kind: PartyKind) -> Result<[u8; 32], KeyCacheError> {
        let (org, id) = split_party_id(party);
        debug!(party, "fetching mailbox key from directory");
        let key_hex = match kind {
            PartyKind::Node => self
                .directory
                .get_node(org, id)?
                .map(|n| n.public_key)
                .unwrap_or_default(),
            PartyKind::Agbot => self
                .directory
                .get_agbot(org, id)?
                .map(|a| a.public_key)
                .unwrap_or_default(),
        };
        if key_hex.is_empty() {
            return Err(KeyCacheError::NoKey {
                party: party.to_string(),
            });
        }
        let bytes = hex::decode(&key_hex).map_err(|_| KeyCacheError::BadKey {
            party: party.to_string(),
        })?;
        bytes.try_into().map_err(|_| KeyCacheError::BadKey {
            party: party.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mem::MemDirectory;
    use crate::exchange::types::Node;

    fn directory_with_node() -> Arc<MemDirectory> {
        let dir = MemDirectory::new();
        dir.put_node(
            "myorg",
            "node1",
            &Node {
                public_key: "ab".repeat(32),
                ..Default::default()
            },
        )
        .unwrap();
        dir.put_node("myorg", "keyless", &Node::default()).unwrap();
        Arc::new(dir)
    }

    #[test]
    fn test_cache_hit_avoids_refetch() {
        let dir = directory_with_node();
        let cache = KeyCache::new(dir.clone(), Duration::from_secs(60));
        let a = cache.mailbox_key("myorg/node1", PartyKind::Node).unwrap();
        let b = cache.mailbox_key("myorg/node1", PartyKind::Node).unwrap();
        assert_eq!(a, b);
        assert_eq!(dir.node_fetch_count(), 1);
    }

    #[test]
    fn test_expiry_triggers_refetch() {
        let dir = directory_with_node();
        let cache = KeyCache::new(dir.clone(), Duration::from_millis(1));
        cache.mailbox_key("myorg/node1", PartyKind::Node).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.mailbox_key("myorg/node1", PartyKind::Node).unwrap();
        assert_eq!(dir.node_fetch_count(), 2);
    }

    #[test]
    fn test_missing_key_is_not_cached() {
        let dir = directory_with_node();
        let cache = KeyCache::new(dir.clone(), Duration::from_secs(60));
        assert!(matches!(
            cache.mailbox_key("myorg/keyless", PartyKind::Node),
            Err(KeyCacheError::NoKey { .. })
        ));
        // The failure was not cached; the next call fetches again.
        let _ = cache.mailbox_key("myorg/keyless", PartyKind::Node);
        assert_eq!(dir.node_fetch_count(), 2);
    }
}
