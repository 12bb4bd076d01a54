//! The persisted agreement record and its lifecycle.
//!
//! # State Machine
//!
//! ```text
//! (none) --proposal sent/received--> Proposed
//! Proposed --reply accepted--> Replied
//! Replied --anchor create seen--> Confirmed
//! Confirmed --workload started--> Active
//! Active --data verified--> Active (timestamp refreshed)
//! any non-terminal --termination intent--> Terminating
//! Terminating --anchor cancel seen / drain timeout--> Archived
//! ```
//!
//! Archived is terminal: no accessor will transition an archived record,
//! and an archived record always carries a nonzero termination reason and
//! timestamp.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::protocols::AnchorBinding;
use crate::policy::workload::Workload;
use crate::protocol::message::MeterReading;

/// Errors from agreement mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AgreementError {
    /// The requested transition is not legal from the current state.
    #[error("agreement {agreement_id}: cannot move from {from} to {to}")]
    BadTransition {
        /// Agreement id.
        agreement_id: String,
        /// Current state.
        from: AgreementState,
        /// Requested state.
        to: AgreementState,
    },
}

/// Which side of the agreement this process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgreementRole {
    /// We initiated the proposal (agbot).
    Consumer,
    /// We received the proposal (node).
    Producer,
}

/// Lifecycle state of an agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgreementState {
    /// Proposal sent (consumer) or accepted-and-replied-to (producer,
    /// transiently while the reply is in flight).
    Proposed,
    /// Positive reply processed; awaiting the anchor confirmation.
    Replied,
    /// Anchor create event observed.
    Confirmed,
    /// Workload executing.
    Active,
    /// Termination intent recorded; cleanup in progress.
    Terminating,
    /// Terminated and finalized. Terminal.
    Archived,
}

impl AgreementState {
    /// Wire string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::Replied => "REPLIED",
            Self::Confirmed => "CONFIRMED",
            Self::Active => "ACTIVE",
            Self::Terminating => "TERMINATING",
            Self::Archived => "ARCHIVED",
        }
    }

    /// Whether any further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl std::fmt::Display for AgreementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bilateral contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    /// 128-bit id, lowercase hex.
    pub id: String,
    /// Which side this record belongs to.
    pub role: AgreementRole,
    /// Protocol name.
    pub protocol: String,
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Counter party id, `org/id` form.
    pub counter_party_id: String,
    /// Counter party signing address, once known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub counter_party_address: String,
    /// Producer policy the agreement was made against, canonical JSON.
    pub producer_policy: String,
    /// Name of the local policy the agreement is bound to.
    pub policy_name: String,
    /// Organization of the local policy.
    pub org: String,
    /// The merged terms, canonical JSON.
    pub ts_and_cs: String,
    /// SHA-256 of the terms, lowercase hex.
    pub terms_hash: String,
    /// Producer's signature over the terms hash, once received.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub terms_signature: String,
    /// The workload being placed.
    pub workload: Workload,
    /// The anchor chosen to witness the agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorBinding>,

    /// Creation time, seconds since the epoch.
    pub created: u64,
    /// When a positive reply was processed.
    #[serde(default)]
    pub reply_received: u64,
    /// When the anchor create event was observed.
    #[serde(default)]
    pub confirmed: u64,
    /// When the workload began executing.
    #[serde(default)]
    pub execution_started: u64,
    /// Last time data flow was verified.
    #[serde(default)]
    pub data_verified: u64,
    /// Last data-received notification, either direction.
    #[serde(default)]
    pub data_notification: u64,
    /// When termination began.
    #[serde(default)]
    pub terminated: u64,
    /// When the record was archived.
    #[serde(default)]
    pub finalized: u64,
    /// Classified termination reason.
    #[serde(default)]
    pub terminated_reason: u32,
    /// Operator-facing termination description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub terminated_description: String,
    /// Set when the anchor write for this agreement failed.
    #[serde(default)]
    pub anchor_write_failed: bool,
    /// Most recent validated metering notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_meter: Option<MeterReading>,

    /// Current lifecycle state.
    pub state: AgreementState,
}

impl Agreement {
    /// Creates a record in the `Proposed` state.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        role: AgreementRole,
        protocol: impl Into<String>,
        protocol_version: u32,
        counter_party_id: impl Into<String>,
        policy_name: impl Into<String>,
        org: impl Into<String>,
        ts_and_cs: String,
        terms_hash: String,
        producer_policy: String,
        workload: Workload,
        created: u64,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            protocol: protocol.into(),
            protocol_version,
            counter_party_id: counter_party_id.into(),
            counter_party_address: String::new(),
            producer_policy,
            policy_name: policy_name.into(),
            org: org.into(),
            ts_and_cs,
            terms_hash,
            terms_signature: String::new(),
            workload,
            anchor: None,
            created,
            reply_received: 0,
            confirmed: 0,
            execution_started: 0,
            data_verified: 0,
            data_notification: 0,
            terminated: 0,
            finalized: 0,
            terminated_reason: 0,
            terminated_description: String::new(),
            anchor_write_failed: false,
            last_meter: None,
            state: AgreementState::Proposed,
        }
    }

    fn transition(&mut self, to: AgreementState) -> Result<(), AgreementError> {
        let legal = matches!(
            (self.state, to),
            (AgreementState::Proposed, AgreementState::Replied)
                | (AgreementState::Replied, AgreementState::Confirmed)
                | (AgreementState::Confirmed, AgreementState::Active)
                | (
                    AgreementState::Proposed
                        | AgreementState::Replied
                        | AgreementState::Confirmed
                        | AgreementState::Active,
                    AgreementState::Terminating
                )
                | (AgreementState::Terminating, AgreementState::Archived)
        );
        if !legal {
            return Err(AgreementError::BadTransition {
                agreement_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Records a processed positive reply.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] unless the record is `Proposed`.
    pub fn mark_replied(
        &mut self,
        now: u64,
        address: &str,
        signature: &str,
    ) -> Result<(), AgreementError> {
        self.transition(AgreementState::Replied)?;
        self.reply_received = now;
        self.counter_party_address = address.to_string();
        self.terms_signature = signature.to_string();
        Ok(())
    }

    /// Records the anchor create event.
    ///
    /// Idempotent when already confirmed or beyond.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] from `Proposed` or `Archived`.
    pub fn mark_confirmed(&mut self, now: u64) -> Result<(), AgreementError> {
        if matches!(
            self.state,
            AgreementState::Confirmed | AgreementState::Active
        ) {
            return Ok(());
        }
        self.transition(AgreementState::Confirmed)?;
        self.confirmed = now;
        Ok(())
    }

    /// Records the start of workload execution.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] unless the record is `Confirmed`.
    pub fn mark_execution_started(&mut self, now: u64) -> Result<(), AgreementError> {
        self.transition(AgreementState::Active)?;
        self.execution_started = now;
        Ok(())
    }

    /// Refreshes the data-verified timestamp. Legal only while active.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] unless the record is `Active`.
    pub fn mark_data_verified(&mut self, now: u64) -> Result<(), AgreementError> {
        if self.state != AgreementState::Active {
            return Err(AgreementError::BadTransition {
                agreement_id: self.id.clone(),
                from: self.state,
                to: AgreementState::Active,
            });
        }
        self.data_verified = now;
        Ok(())
    }

    /// Records termination intent with a classified reason.
    ///
    /// Idempotent when already terminating; the first reason wins.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] when the record is archived.
    pub fn mark_terminating(
        &mut self,
        now: u64,
        reason: u32,
        description: &str,
    ) -> Result<(), AgreementError> {
        if self.state == AgreementState::Terminating {
            return Ok(());
        }
        self.transition(AgreementState::Terminating)?;
        self.terminated = now;
        self.terminated_reason = reason;
        self.terminated_description = description.to_string();
        Ok(())
    }

    /// Finalizes a terminating record.
    ///
    /// # Errors
    ///
    /// [`AgreementError::BadTransition`] unless the record is
    /// `Terminating`.
    pub fn mark_archived(&mut self, now: u64) -> Result<(), AgreementError> {
        self.transition(AgreementState::Archived)?;
        self.finalized = now;
        Ok(())
    }
}
