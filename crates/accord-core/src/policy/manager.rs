//! In-memory policy registry shared by all workers.
//!
//! The manager holds two partitioned sets: producer policies (one per
//! local service) and consumer policies (one per organization-scoped
//! deployment intent). Reads never wait on a mutation in progress: the
//! maps live in an immutable snapshot behind an `Arc` that mutators clone,
//! edit, and swap wholesale. Per-policy active-agreement counters enforce
//! `maxAgreements`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use super::{match_policies, MatchError, MatchResult, Policy};

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyManagerError {
    /// The named policy is not registered.
    #[error("policy '{org}/{name}' not found")]
    NotFound {
        /// Organization.
        org: String,
        /// Policy name.
        name: String,
    },

    /// The policy already has its maximum number of agreements.
    #[error("policy '{org}/{name}' is at its agreement cap of {cap}")]
    MaxAgreementsReached {
        /// Organization.
        org: String,
        /// Policy name.
        name: String,
        /// The cap that was hit.
        cap: u32,
    },

    /// The agreement is already recorded against the policy.
    #[error("agreement {agreement_id} already recorded")]
    AlreadyRecorded {
        /// Agreement id.
        agreement_id: String,
    },
}

/// Which partition a policy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicySide {
    /// Policies generated from local services (the node).
    Producer,
    /// Policies describing deployment intents (the agbot).
    Consumer,
}

/// Change notice returned by mutations, for the caller to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyChange {
    /// A policy was added, or replaced an existing policy of the same name.
    Upserted {
        /// Partition.
        side: PolicySide,
        /// Organization.
        org: String,
        /// The new policy.
        policy: Arc<Policy>,
    },
    /// A policy was removed.
    Deleted {
        /// Partition.
        side: PolicySide,
        /// Organization.
        org: String,
        /// Name of the removed policy.
        name: String,
    },
}

type PolicyMap = HashMap<String, HashMap<String, Arc<Policy>>>;

#[derive(Debug, Default, Clone)]
struct Snapshot {
    producer: PolicyMap,
    consumer: PolicyMap,
}

impl Snapshot {
    fn partition(&self, side: PolicySide) -> &PolicyMap {
        match side {
            PolicySide::Producer => &self.producer,
            PolicySide::Consumer => &self.consumer,
        }
    }

    fn partition_mut(&mut self, side: PolicySide) -> &mut PolicyMap {
        match side {
            PolicySide::Producer => &mut self.producer,
            PolicySide::Consumer => &mut self.consumer,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    /// (org, policy name) -> ids of non-archived agreements bound to it.
    bound: HashMap<(String, String), HashSet<String>>,
}

/// The shared policy registry.
///
/// Cloneable-by-`Arc`; one instance is shared by every worker in the
/// process.
#[derive(Debug, Default)]
pub struct PolicyManager {
    snapshot: RwLock<Arc<Snapshot>>,
    counters: Mutex<Counters>,
    current_protocol_version: u32,
}

impl PolicyManager {
    /// Creates an empty manager negotiating up to the given protocol
    /// version.
    #[must_use]
    pub fn new(current_protocol_version: u32) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            counters: Mutex::new(Counters::default()),
            current_protocol_version,
        }
    }

    fn read(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn mutate(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Copy-on-write: readers holding the old Arc are unaffected.
        let mut next = Snapshot::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Registers (or replaces) a policy and returns the change notice to
    /// publish on the bus.
    pub fn register(&self, side: PolicySide, org: &str, policy: Policy) -> PolicyChange {
        let policy = Arc::new(policy);
        let name = policy.header.name.clone();
        let stored = policy.clone();
        self.mutate(|snap| {
            snap.partition_mut(side)
                .entry(org.to_string())
                .or_default()
                .insert(name.clone(), stored);
        });
        PolicyChange::Upserted {
            side,
            org: org.to_string(),
            policy,
        }
    }

    /// Deletes a policy.
    ///
    /// # Errors
    ///
    /// [`PolicyManagerError::NotFound`] when no such policy exists.
    pub fn delete(
        &self,
        side: PolicySide,
        org: &str,
        name: &str,
    ) -> Result<PolicyChange, PolicyManagerError> {
        let mut removed = false;
        self.mutate(|snap| {
            if let Some(by_name) = snap.partition_mut(side).get_mut(org) {
                removed = by_name.remove(name).is_some();
                if by_name.is_empty() {
                    snap.partition_mut(side).remove(org);
                }
            }
        });
        if !removed {
            return Err(PolicyManagerError::NotFound {
                org: org.to_string(),
                name: name.to_string(),
            });
        }
        Ok(PolicyChange::Deleted {
            side,
            org: org.to_string(),
            name: name.to_string(),
        })
    }

    /// Returns all policies of a partition within an organization.
    #[must_use]
    pub fn get_all(&self, side: PolicySide, org: &str) -> Vec<Arc<Policy>> {
        self.read()
            .partition(side)
            .get(org)
            .map(|by_name| by_name.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every (org, policy) pair of a partition.
    #[must_use]
    pub fn all_entries(&self, side: PolicySide) -> Vec<(String, Arc<Policy>)> {
        let snap = self.read();
        let mut out = Vec::new();
        for (org, by_name) in snap.partition(side) {
            for policy in by_name.values() {
                out.push((org.clone(), policy.clone()));
            }
        }
        out
    }

    /// Looks up one policy.
    #[must_use]
    pub fn find(&self, side: PolicySide, org: &str, name: &str) -> Option<Arc<Policy>> {
        self.read()
            .partition(side)
            .get(org)
            .and_then(|by_name| by_name.get(name))
            .cloned()
    }

    /// Evaluates producer/consumer compatibility.
    ///
    /// # Errors
    ///
    /// Propagates [`MatchError`] from the underlying matcher.
    pub fn matches(&self, producer: &Policy, consumer: &Policy) -> Result<MatchResult, MatchError> {
        match_policies(producer, consumer, self.current_protocol_version)
    }

    /// Binds an agreement to a policy, enforcing the policy's cap.
    ///
    /// # Errors
    ///
    /// [`PolicyManagerError::MaxAgreementsReached`] at the cap,
    /// [`PolicyManagerError::AlreadyRecorded`] on a duplicate id.
    pub fn record_agreement(
        &self,
        agreement_id: &str,
        policy: &Policy,
        org: &str,
    ) -> Result<(), PolicyManagerError> {
        let cap = policy.agreement_cap();
        let key = (org.to_string(), policy.header.name.clone());
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bound = counters.bound.entry(key).or_default();
        if bound.contains(agreement_id) {
            return Err(PolicyManagerError::AlreadyRecorded {
                agreement_id: agreement_id.to_string(),
            });
        }
        if bound.len() as u32 >= cap {
            return Err(PolicyManagerError::MaxAgreementsReached {
                org: org.to_string(),
                name: policy.header.name.clone(),
                cap,
            });
        }
        bound.insert(agreement_id.to_string());
        Ok(())
    }

    /// Unbinds an agreement from a policy. Unknown ids are ignored; the
    /// cancel path must be idempotent.
    pub fn cancel_agreement(&self, agreement_id: &str, policy_name: &str, org: &str) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(bound) = counters
            .bound
            .get_mut(&(org.to_string(), policy_name.to_string()))
        {
            bound.remove(agreement_id);
        }
    }

    /// Number of agreements currently bound to a policy.
    #[must_use]
    pub fn agreement_count(&self, policy_name: &str, org: &str) -> u32 {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters
            .bound
            .get(&(org.to_string(), policy_name.to_string()))
            .map_or(0, |b| b.len() as u32)
    }

    /// Whether the policy has room for one more agreement.
    #[must_use]
    pub fn has_capacity(&self, policy: &Policy, org: &str) -> bool {
        self.agreement_count(&policy.header.name, org) < policy.agreement_cap()
    }
}
