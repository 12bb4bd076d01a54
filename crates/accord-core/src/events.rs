//! Typed events broadcast between workers.
//!
//! Workers communicate exclusively by posting these events to the bus;
//! each subscriber receives its own copy in post order. The severity of an
//! event selects the queue back-pressure policy: routine events are
//! dropped oldest-first under load, agreement-critical events block the
//! poster (with a deadline) instead.

use std::sync::Arc;

use crate::agreement::AgreementRole;
use crate::anchor::AnchorEvent;
use crate::policy::manager::PolicySide;
use crate::policy::Policy;

/// Queue policy class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// May be dropped oldest-first when a subscriber queue is full.
    Routine,
    /// Must not be dropped; posting blocks up to a deadline.
    Critical,
}

/// Discriminant used by workers to declare their subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// [`Event::PolicyChanged`]
    PolicyChanged,
    /// [`Event::PolicyDeleted`]
    PolicyDeleted,
    /// [`Event::NodeRegistered`]
    NodeRegistered,
    /// [`Event::NodeConfigured`]
    NodeConfigured,
    /// [`Event::NodeUnconfiguring`]
    NodeUnconfiguring,
    /// [`Event::AgreementReached`]
    AgreementReached,
    /// [`Event::AgreementTimeout`]
    AgreementTimeout,
    /// [`Event::WorkloadStarted`]
    WorkloadStarted,
    /// [`Event::WorkloadFault`]
    WorkloadFault,
    /// [`Event::DataVerified`]
    DataVerified,
    /// [`Event::Anchor`]
    Anchor,
    /// [`Event::WorkerStop`]
    WorkerStop,
    /// [`Event::WorkerStopComplete`]
    WorkerStopComplete,
}

/// An event on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A policy was registered or replaced.
    PolicyChanged {
        /// Partition the policy belongs to.
        side: PolicySide,
        /// Organization.
        org: String,
        /// The new policy.
        policy: Arc<Policy>,
    },
    /// A policy was deleted.
    PolicyDeleted {
        /// Partition the policy belonged to.
        side: PolicySide,
        /// Organization.
        org: String,
        /// Name of the removed policy.
        name: String,
    },
    /// The node registered itself with the directory.
    NodeRegistered {
        /// Node organization.
        org: String,
        /// Node id.
        id: String,
        /// Pattern the node declared, if any.
        pattern: Option<String>,
    },
    /// The node finished configuration; producer policies exist.
    NodeConfigured {
        /// Node organization.
        org: String,
        /// Node id.
        id: String,
    },
    /// The node is being unconfigured; agreements must wind down.
    NodeUnconfiguring,
    /// An agreement is confirmed and its workload should launch.
    AgreementReached {
        /// Agreement id.
        agreement_id: String,
        /// Protocol the agreement was negotiated under.
        protocol: String,
    },
    /// Governance determined an agreement must be cancelled.
    AgreementTimeout {
        /// Agreement id.
        agreement_id: String,
        /// Protocol the agreement runs.
        protocol: String,
        /// Classified reason code.
        reason: u32,
        /// Which side's worker owns the cancellation.
        role: AgreementRole,
    },
    /// The container collaborator reports an agreement's workload running.
    WorkloadStarted {
        /// Agreement id.
        agreement_id: String,
    },
    /// Governance observed verified data flow for an agreement.
    DataVerified {
        /// Agreement id.
        agreement_id: String,
    },
    /// The workload of an agreement failed on the node.
    WorkloadFault {
        /// Agreement id.
        agreement_id: String,
        /// Classified failure code.
        failure_code: u32,
        /// Diagnostic for the event log.
        description: String,
    },
    /// An event was observed on the anchor.
    Anchor(AnchorEvent),
    /// First phase of shutdown: finish in-flight work and stop.
    WorkerStop,
    /// A worker finished draining.
    WorkerStopComplete {
        /// Name of the worker that stopped.
        worker: String,
    },
}

impl From<crate::policy::manager::PolicyChange> for Event {
    fn from(change: crate::policy::manager::PolicyChange) -> Self {
        use crate::policy::manager::PolicyChange;
        match change {
            PolicyChange::Upserted { side, org, policy } => Self::PolicyChanged { side, org, policy },
            PolicyChange::Deleted { side, org, name } => Self::PolicyDeleted { side, org, name },
        }
    }
}

impl Event {
    /// The subscription discriminant of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::PolicyChanged { .. } => EventKind::PolicyChanged,
            Self::PolicyDeleted { .. } => EventKind::PolicyDeleted,
            Self::NodeRegistered { .. } => EventKind::NodeRegistered,
            Self::NodeConfigured { .. } => EventKind::NodeConfigured,
            Self::NodeUnconfiguring => EventKind::NodeUnconfiguring,
            Self::AgreementReached { .. } => EventKind::AgreementReached,
            Self::AgreementTimeout { .. } => EventKind::AgreementTimeout,
            Self::WorkloadStarted { .. } => EventKind::WorkloadStarted,
            Self::WorkloadFault { .. } => EventKind::WorkloadFault,
            Self::DataVerified { .. } => EventKind::DataVerified,
            Self::Anchor(_) => EventKind::Anchor,
            Self::WorkerStop => EventKind::WorkerStop,
            Self::WorkerStopComplete { .. } => EventKind::WorkerStopComplete,
        }
    }

    /// The queue policy class of this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::NodeRegistered { .. }
            | Self::NodeConfigured { .. }
            | Self::WorkerStopComplete { .. } => Severity::Routine,
            _ => Severity::Critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_severity() {
        let ev = Event::WorkerStop;
        assert_eq!(ev.kind(), EventKind::WorkerStop);
        assert_eq!(ev.severity(), Severity::Critical);

        let ev = Event::NodeConfigured {
            org: "myorg".into(),
            id: "node1".into(),
        };
        assert_eq!(ev.severity(), Severity::Routine);
    }
}
