//! The protocol engine: message construction, decisions, and verification.
//!
//! The engine is transport-agnostic. It produces fully validated
//! [`ProtocolMessage`] values and leaves delivery to a [`MessageSender`]
//! implementation (the directory-relayed sealed mailbox in production,
//! plain queues in tests).

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::canonical::{terms_hash, to_canonical_json, CanonicalError};
use super::message::{
    BaseMessage, Cancel, ConsumerUpdate, ConsumerUpdateAck, DataReceived, DataReceivedAck,
    MeterNotification, MeterReading, MessageError, ProducerUpdate, ProducerUpdateAck, Proposal,
    ProposalReply, ProtocolMessage, ReplyAck,
};
use super::signing::{verify_hash, CryptoError, PartyKey};
use super::{PROTOCOL_CURRENT_VERSION, PROTOCOL_NAME};
use crate::policy::protocols::AnchorBinding;
use crate::policy::workload::Workload;
use crate::policy::{match_policies, MatchResult, Policy};

/// Errors from engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Terms serialization failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// A message failed validation.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Signing or verification failed structurally.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An embedded policy document did not parse.
    #[error("embedded policy did not parse: {0}")]
    PolicyParse(#[from] serde_json::Error),

    /// Message delivery failed.
    #[error("transport: {0}")]
    Transport(String),
}

/// Delivers serialized protocol messages to a counter party.
///
/// `to` is the counter party id in `org/id` form. Implementations are
/// responsible for sealing the payload to the recipient's published
/// mailbox key.
pub trait MessageSender {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns a transport diagnostic on failure; the engine surfaces it
    /// as [`EngineError::Transport`].
    fn send(&self, to: &str, payload: &[u8]) -> Result<(), String>;
}

/// The producer's decision about one proposal.
#[derive(Debug)]
pub struct Decision {
    /// The reply to send back, accepting or rejecting.
    pub reply: ProposalReply,
    /// The parsed terms, present when accepting.
    pub terms: Option<Policy>,
    /// The lowercase-hex terms hash, present when accepting.
    pub terms_hash: Option<String>,
    /// Name of the local policy that matched, present when accepting.
    pub policy_name: Option<String>,
}

/// Builds and checks protocol messages for one protocol name/version.
#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    name: String,
    current_version: u32,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine {
    /// Creates the engine for the crate's protocol at the current version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: PROTOCOL_NAME.to_string(),
            current_version: PROTOCOL_CURRENT_VERSION,
        }
    }

    /// The protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The highest version this engine speaks.
    #[must_use]
    pub const fn current_version(&self) -> u32 {
        self.current_version
    }

    fn base(&self, version: u32, agreement_id: &str) -> BaseMessage {
        BaseMessage::new(self.name.clone(), version, agreement_id)
    }

    /// Builds the initial proposal from a matched policy pair.
    ///
    /// The negotiated version is the minimum of the two sides' maximums,
    /// already computed into `matched`.
    ///
    /// # Errors
    ///
    /// Canonicalization failures only; the inputs were validated by the
    /// matcher.
    pub fn build_proposal(
        &self,
        agreement_id: &str,
        producer_policy: &Policy,
        consumer_policy: &Policy,
        matched: &MatchResult,
        workload: &Workload,
        consumer_id: &str,
    ) -> Result<Proposal, EngineError> {
        let merged = Policy::merge(producer_policy, consumer_policy, workload, matched);
        let ts_and_cs = to_canonical_json(&merged)?;
        let producer_text = to_canonical_json(producer_policy)?;
        debug!(
            agreement_id,
            version = matched.protocol.protocol_version,
            "built proposal"
        );
        Ok(Proposal {
            base: self.base(matched.protocol.protocol_version, agreement_id),
            ts_and_cs,
            producer_policy: producer_text,
            consumer_id: consumer_id.to_string(),
        })
    }

    /// Decides on an incoming proposal.
    ///
    /// The match the consumer claims is not trusted: the embedded terms
    /// are re-matched against the node's own producer policies. On
    /// acceptance the reply carries the signed terms hash, this party's
    /// address, and the chosen anchor.
    ///
    /// # Errors
    ///
    /// Structural failures only (unparseable embedded policy); an
    /// unmatchable proposal produces a rejection reply, not an error.
    pub fn decide_on_proposal(
        &self,
        proposal: &Proposal,
        local_policies: &[Arc<Policy>],
        key: &PartyKey,
    ) -> Result<Decision, EngineError> {
        let terms: Policy = serde_json::from_str(&proposal.ts_and_cs)?;

        let matched = local_policies
            .iter()
            .find_map(|local| match match_policies(local, &terms, self.current_version) {
                Ok(m) => Some((local.header.name.clone(), m)),
                Err(err) => {
                    debug!(
                        agreement_id = %proposal.base.agreement_id,
                        policy = %local.header.name,
                        %err,
                        "proposal does not match local policy"
                    );
                    None
                }
            });

        let Some((policy_name, matched)) = matched else {
            return Ok(Decision {
                reply: ProposalReply {
                    base: self.base(proposal.base.version, &proposal.base.agreement_id),
                    accept: false,
                    signature: String::new(),
                    address: String::new(),
                    anchor: None,
                },
                terms: None,
                terms_hash: None,
                policy_name: None,
            });
        };

        let hash = terms_hash(&proposal.ts_and_cs);
        let signature = key.sign_hash(&hash);
        let anchor = choose_anchor(&matched);
        Ok(Decision {
            reply: ProposalReply {
                base: self.base(proposal.base.version, &proposal.base.agreement_id),
                accept: true,
                signature,
                address: key.address(),
                anchor,
            },
            terms: Some(terms),
            terms_hash: Some(hash),
            policy_name: Some(policy_name),
        })
    }

    /// Verifies a reply's signature against the proposal it answers.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] when the address or signature is structurally
    /// malformed; a well-formed but wrong signature returns `Ok(false)`.
    pub fn verify_reply(&self, ts_and_cs: &str, reply: &ProposalReply) -> Result<bool, EngineError> {
        let hash = terms_hash(ts_and_cs);
        Ok(verify_hash(&reply.address, &hash, &reply.signature)?)
    }

    /// Builds the consumer's confirmation of a reply.
    #[must_use]
    pub fn build_reply_ack(&self, version: u32, agreement_id: &str, proceed: bool) -> ReplyAck {
        ReplyAck {
            base: self.base(version, agreement_id),
            proceed,
        }
    }

    /// Builds a data-received notice.
    #[must_use]
    pub fn build_data_received(&self, version: u32, agreement_id: &str) -> DataReceived {
        DataReceived {
            base: self.base(version, agreement_id),
        }
    }

    /// Builds the ack for a data-received notice.
    #[must_use]
    pub fn build_data_received_ack(&self, version: u32, agreement_id: &str) -> DataReceivedAck {
        DataReceivedAck {
            base: self.base(version, agreement_id),
        }
    }

    /// Builds a signed metering notification.
    #[must_use]
    pub fn build_meter_notification(
        &self,
        version: u32,
        agreement_id: &str,
        mut meter: MeterReading,
        key: &PartyKey,
    ) -> MeterNotification {
        meter.consumer_signature = key.sign_hash(&meter.reading_hash());
        MeterNotification {
            base: self.base(version, agreement_id),
            meter,
        }
    }

    /// Builds a cancellation notice.
    #[must_use]
    pub fn build_cancel(&self, version: u32, agreement_id: &str, reason: u32) -> Cancel {
        Cancel {
            base: self.base(version, agreement_id),
            reason,
        }
    }

    /// Builds the consumer's anchor-account advertisement.
    #[must_use]
    pub fn build_consumer_update(
        &self,
        version: u32,
        agreement_id: &str,
        key: &PartyKey,
    ) -> ConsumerUpdate {
        ConsumerUpdate {
            base: self.base(version, agreement_id),
            address: key.address(),
        }
    }

    /// Builds the ack for a consumer update.
    #[must_use]
    pub fn build_consumer_update_ack(&self, version: u32, agreement_id: &str) -> ConsumerUpdateAck {
        ConsumerUpdateAck {
            base: self.base(version, agreement_id),
        }
    }

    /// Builds the producer's anchor-account advertisement, re-signing the
    /// terms hash.
    #[must_use]
    pub fn build_producer_update(
        &self,
        version: u32,
        agreement_id: &str,
        hash: &str,
        key: &PartyKey,
    ) -> ProducerUpdate {
        ProducerUpdate {
            base: self.base(version, agreement_id),
            address: key.address(),
            signature: key.sign_hash(hash),
        }
    }

    /// Builds the ack for a producer update.
    #[must_use]
    pub fn build_producer_update_ack(&self, version: u32, agreement_id: &str) -> ProducerUpdateAck {
        ProducerUpdateAck {
            base: self.base(version, agreement_id),
        }
    }

    /// Serializes and delivers a message.
    ///
    /// # Errors
    ///
    /// [`EngineError::Transport`] when the sender fails.
    pub fn send(
        &self,
        msg: &ProtocolMessage,
        to: &str,
        sender: &dyn MessageSender,
    ) -> Result<(), EngineError> {
        let bytes = msg
            .to_bytes()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        sender.send(to, &bytes).map_err(EngineError::Transport)
    }
}

/// Picks the anchor instance for an accepted proposal: the first binding
/// the negotiated protocol entry names, if any.
#[must_use]
pub fn choose_anchor(matched: &MatchResult) -> Option<AnchorBinding> {
    matched.protocol.anchors.first().cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::policy::api_spec::ApiSpec;
    use crate::policy::protocols::AgreementProtocol;
    use crate::policy::property::{CompareOp, Constraint, Property, PropertyValue};
    use crate::protocol::signing::new_agreement_id;

    struct RecordingSender {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, to: &str, payload: &[u8]) -> Result<(), String> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn producer_policy() -> Policy {
        let mut p = Policy::named("device-svcA");
        p.api_specs = vec![ApiSpec::new(
            "https://svc/a",
            "myorg",
            "1.2.0".parse().unwrap(),
            "amd64",
        )];
        p.agreement_protocols = vec![AgreementProtocol::new(PROTOCOL_NAME)];
        p.properties = vec![Property::new("ram", PropertyValue::Int(4096))];
        p
    }

    fn consumer_policy() -> Policy {
        let mut c = Policy::named("workload-svcA");
        c.api_specs = vec![ApiSpec::new(
            "https://svc/a",
            "myorg",
            "[1.0.0,2.0.0)".parse().unwrap(),
            "amd64",
        )];
        c.agreement_protocols = vec![AgreementProtocol::new(PROTOCOL_NAME)];
        c.workloads = vec![Workload {
            workload_url: "https://wl/a".into(),
            org: "myorg".into(),
            version: "1.0.0".into(),
            arch: "amd64".into(),
            ..Default::default()
        }];
        c
    }

    fn matched() -> MatchResult {
        match_policies(&producer_policy(), &consumer_policy(), 2).unwrap()
    }

    #[test]
    fn test_proposal_reply_signature_round_trip() {
        let engine = ProtocolEngine::new();
        let m = matched();
        let proposal = engine
            .build_proposal(
                &new_agreement_id(),
                &producer_policy(),
                &consumer_policy(),
                &m,
                &m.workloads[0],
                "myorg/agbot1",
            )
            .unwrap();

        let node_key = PartyKey::generate();
        let local = vec![Arc::new(producer_policy())];
        let decision = engine.decide_on_proposal(&proposal, &local, &node_key).unwrap();
        assert!(decision.reply.accept);
        assert_eq!(decision.reply.address, node_key.address());

        // The consumer verifies the signature it got back.
        assert!(engine.verify_reply(&proposal.ts_and_cs, &decision.reply).unwrap());

        // Tampered terms must not verify.
        let tampered = proposal.ts_and_cs.replace("1.2.0", "1.3.0");
        assert!(!engine.verify_reply(&tampered, &decision.reply).unwrap());
    }

    #[test]
    fn test_decide_rejects_when_no_local_policy_matches() {
        let engine = ProtocolEngine::new();
        let m = matched();
        let proposal = engine
            .build_proposal(
                &new_agreement_id(),
                &producer_policy(),
                &consumer_policy(),
                &m,
                &m.workloads[0],
                "myorg/agbot1",
            )
            .unwrap();

        // The node's real policy demands more RAM than the terms advertise.
        let mut strict = producer_policy();
        strict.counter_party_properties = Some(Constraint::Require {
            name: "ram".into(),
            op: CompareOp::Gte,
            value: "1048576".into(),
        });
        let key = PartyKey::generate();
        let decision = engine
            .decide_on_proposal(&proposal, &[Arc::new(strict)], &key)
            .unwrap();
        assert!(!decision.reply.accept);
        assert!(decision.reply.signature.is_empty());
        assert!(decision.terms.is_none());
    }

    #[test]
    fn test_terms_are_canonical_and_stable() {
        let engine = ProtocolEngine::new();
        let m = matched();
        let id = new_agreement_id();
        let p1 = engine
            .build_proposal(
                &id,
                &producer_policy(),
                &consumer_policy(),
                &m,
                &m.workloads[0],
                "myorg/agbot1",
            )
            .unwrap();
        let p2 = engine
            .build_proposal(
                &id,
                &producer_policy(),
                &consumer_policy(),
                &m,
                &m.workloads[0],
                "myorg/agbot1",
            )
            .unwrap();
        assert_eq!(p1.ts_and_cs, p2.ts_and_cs);
        assert_eq!(terms_hash(&p1.ts_and_cs), terms_hash(&p2.ts_and_cs));
    }

    #[test]
    fn test_send_serializes_tagged_envelope() {
        let engine = ProtocolEngine::new();
        let sender = RecordingSender {
            sent: Mutex::new(Vec::new()),
        };
        let cancel = ProtocolMessage::Cancel(engine.build_cancel(2, &new_agreement_id(), 201));
        engine.send(&cancel, "myorg/node1", &sender).unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "myorg/node1");
        let parsed = ProtocolMessage::parse(&sent[0].1).unwrap();
        assert_eq!(parsed, cancel);
    }
}
