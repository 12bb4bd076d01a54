//! Protocol message envelope and per-variant validation.
//!
//! Messages travel as JSON discriminated by `msgType`. Every message
//! carries the base fields `{protocol, version, agreementId}`; variants
//! add their own payload fields. Unknown variants fail deserialization and
//! are treated as protocol violations by the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::protocols::AnchorBinding;

/// Length of an agreement id in lowercase hex characters (128 bits).
pub const AGREEMENT_ID_LEN: usize = 32;

/// Validation failures for inbound messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageError {
    /// The payload did not parse as a known message.
    #[error("malformed protocol message: {reason}")]
    Malformed {
        /// Parser diagnostic.
        reason: String,
    },

    /// A parsed message failed its variant predicate.
    #[error("invalid {msg_type} message: {reason}")]
    Invalid {
        /// Message kind.
        msg_type: &'static str,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Fields common to every protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseMessage {
    /// Protocol name.
    pub protocol: String,
    /// Negotiated protocol version.
    pub version: u32,
    /// Agreement this message belongs to, lowercase hex.
    pub agreement_id: String,
}

impl BaseMessage {
    /// Creates base fields for an agreement.
    #[must_use]
    pub fn new(protocol: impl Into<String>, version: u32, agreement_id: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            version,
            agreement_id: agreement_id.into(),
        }
    }

    fn is_valid(&self) -> bool {
        !self.protocol.is_empty()
            && self.version >= 2
            && self.agreement_id.len() == AGREEMENT_ID_LEN
            && self
                .agreement_id
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

/// The initial proposal, consumer to producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// Canonical serialization of the merged terms.
    pub ts_and_cs: String,
    /// The producer policy the proposal was built against, as received.
    pub producer_policy: String,
    /// Id of the proposing consumer, `org/id` form.
    pub consumer_id: String,
}

/// The producer's decision, producer to consumer.
///
/// A rejection carries only the base fields and `accept=false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalReply {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// Whether the producer accepts the proposal.
    pub accept: bool,
    /// Signature over the lowercase-hex terms hash, when accepting.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    /// Producer's signing address (lowercase-hex public key).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// Anchor instance the producer chose, when accepting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorBinding>,
}

/// Consumer's acknowledgement of a reply; closes the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAck {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// `true` when the consumer accepted the reply and will anchor the
    /// agreement; `false` tells the producer to discard it.
    pub proceed: bool,
}

/// Consumer notice that verified data has been observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceived {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
}

/// Producer acknowledgement of [`DataReceived`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceivedAck {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
}

/// A metering reading credited to the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    /// Tokens credited.
    pub amount: u64,
    /// Reading timestamp, seconds since the epoch.
    pub current_time: u64,
    /// Hash of the agreement terms the reading applies to.
    pub agreement_hash: String,
    /// Consumer's signature over the reading hash.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub consumer_signature: String,
}

impl MeterReading {
    /// Canonical hash of the reading, the signed object.
    #[must_use]
    pub fn reading_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let text = format!("{}:{}:{}", self.amount, self.current_time, self.agreement_hash);
        hex::encode(Sha256::digest(text.as_bytes()))
    }
}

/// Metering notification, consumer to producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterNotification {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// The signed reading.
    pub meter: MeterReading,
}

/// Cancellation notice; either party may send it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// Classified reason code.
    pub reason: u32,
}

/// Consumer's anchor account advertisement (v2 anchor negotiation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerUpdate {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// Consumer's signing address.
    pub address: String,
}

/// Ack for [`ConsumerUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerUpdateAck {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
}

/// Producer's anchor account and terms signature (v2 anchor negotiation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerUpdate {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
    /// Producer's signing address.
    pub address: String,
    /// Signature over the terms hash.
    pub signature: String,
}

/// Ack for [`ProducerUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerUpdateAck {
    /// Base fields.
    #[serde(flatten)]
    pub base: BaseMessage,
}

/// The tagged union of every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgType", rename_all = "camelCase")]
pub enum ProtocolMessage {
    /// Initial proposal.
    Proposal(Proposal),
    /// Producer decision.
    ProposalReply(ProposalReply),
    /// Consumer confirmation.
    ReplyAck(ReplyAck),
    /// Data observed notice.
    DataReceived(DataReceived),
    /// Ack of the data notice.
    DataReceivedAck(DataReceivedAck),
    /// Metering notification.
    MeterNotification(MeterNotification),
    /// Cancellation.
    Cancel(Cancel),
    /// Consumer anchor advertisement.
    ConsumerUpdate(ConsumerUpdate),
    /// Ack of the consumer advertisement.
    ConsumerUpdateAck(ConsumerUpdateAck),
    /// Producer anchor advertisement.
    ProducerUpdate(ProducerUpdate),
    /// Ack of the producer advertisement.
    ProducerUpdateAck(ProducerUpdateAck),
}

impl ProtocolMessage {
    /// Parses and validates a message from its wire bytes.
    ///
    /// # Errors
    ///
    /// [`MessageError::Malformed`] when the bytes do not parse,
    /// [`MessageError::Invalid`] when the variant predicate fails.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let msg: Self = serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed {
            reason: e.to_string(),
        })?;
        msg.validate()?;
        Ok(msg)
    }

    /// The message kind as a wire string.
    #[must_use]
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::Proposal(_) => "proposal",
            Self::ProposalReply(_) => "proposalReply",
            Self::ReplyAck(_) => "replyAck",
            Self::DataReceived(_) => "dataReceived",
            Self::DataReceivedAck(_) => "dataReceivedAck",
            Self::MeterNotification(_) => "meterNotification",
            Self::Cancel(_) => "cancel",
            Self::ConsumerUpdate(_) => "consumerUpdate",
            Self::ConsumerUpdateAck(_) => "consumerUpdateAck",
            Self::ProducerUpdate(_) => "producerUpdate",
            Self::ProducerUpdateAck(_) => "producerUpdateAck",
        }
    }

    /// The base fields of any variant.
    #[must_use]
    pub const fn base(&self) -> &BaseMessage {
        match self {
            Self::Proposal(m) => &m.base,
            Self::ProposalReply(m) => &m.base,
            Self::ReplyAck(m) => &m.base,
            Self::DataReceived(m) => &m.base,
            Self::DataReceivedAck(m) => &m.base,
            Self::MeterNotification(m) => &m.base,
            Self::Cancel(m) => &m.base,
            Self::ConsumerUpdate(m) => &m.base,
            Self::ConsumerUpdateAck(m) => &m.base,
            Self::ProducerUpdate(m) => &m.base,
            Self::ProducerUpdateAck(m) => &m.base,
        }
    }

    /// The agreement this message belongs to.
    #[must_use]
    pub fn agreement_id(&self) -> &str {
        &self.base().agreement_id
    }

    /// Serializes to wire bytes.
    ///
    /// # Errors
    ///
    /// Propagates serialization failure, which indicates a programming
    /// error in the payload types.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn validate(&self) -> Result<(), MessageError> {
        let invalid = |msg_type: &'static str, reason: &'static str| MessageError::Invalid {
            msg_type,
            reason,
        };

        if !self.base().is_valid() {
            return Err(invalid(self.msg_type(), "bad base fields"));
        }

        match self {
            Self::Proposal(m) => {
                if m.ts_and_cs.is_empty() || m.producer_policy.is_empty() {
                    return Err(invalid("proposal", "missing terms or producer policy"));
                }
                if m.consumer_id.is_empty() {
                    return Err(invalid("proposal", "missing consumer id"));
                }
            }
            Self::ProposalReply(m) => {
                // A rejection legitimately has no signature or address.
                if m.accept && (m.signature.is_empty() || m.address.is_empty()) {
                    return Err(invalid("proposalReply", "acceptance missing signature"));
                }
            }
            Self::MeterNotification(m) => {
                if m.meter.agreement_hash.is_empty() {
                    return Err(invalid("meterNotification", "missing agreement hash"));
                }
            }
            Self::Cancel(m) => {
                if m.reason == 0 {
                    return Err(invalid("cancel", "missing reason code"));
                }
            }
            Self::ConsumerUpdate(m) => {
                if m.address.is_empty() {
                    return Err(invalid("consumerUpdate", "missing address"));
                }
            }
            Self::ProducerUpdate(m) => {
                if m.address.is_empty() || m.signature.is_empty() {
                    return Err(invalid("producerUpdate", "missing address or signature"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseMessage {
        BaseMessage::new("accord-basic", 2, "ab".repeat(16))
    }

    #[test]
    fn test_round_trip_proposal() {
        let msg = ProtocolMessage::Proposal(Proposal {
            base: base(),
            ts_and_cs: "{}".into(),
            producer_policy: "{}".into(),
            consumer_id: "myorg/agbot1".into(),
        });
        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"msgType\":\"proposal\""));
        assert_eq!(ProtocolMessage::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        let text = format!(
            r#"{{"msgType":"mystery","protocol":"accord-basic","version":2,"agreementId":"{}"}}"#,
            "ab".repeat(16)
        );
        assert!(matches!(
            ProtocolMessage::parse(text.as_bytes()),
            Err(MessageError::Malformed { .. })
        ));
    }

    #[test]
    fn test_v1_messages_rejected() {
        let msg = ProtocolMessage::DataReceived(DataReceived {
            base: BaseMessage::new("accord-basic", 1, "ab".repeat(16)),
        });
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            ProtocolMessage::parse(&bytes),
            Err(MessageError::Invalid { .. })
        ));
    }

    #[test]
    fn test_bad_agreement_id_rejected() {
        let msg = ProtocolMessage::DataReceived(DataReceived {
            base: BaseMessage::new("accord-basic", 2, "XYZ"),
        });
        let bytes = msg.to_bytes().unwrap();
        assert!(ProtocolMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_rejection_reply_needs_no_signature() {
        let msg = ProtocolMessage::ProposalReply(ProposalReply {
            base: base(),
            accept: false,
            signature: String::new(),
            address: String::new(),
            anchor: None,
        });
        let bytes = msg.to_bytes().unwrap();
        assert!(ProtocolMessage::parse(&bytes).is_ok());
    }

    #[test]
    fn test_acceptance_reply_requires_signature() {
        let msg = ProtocolMessage::ProposalReply(ProposalReply {
            base: base(),
            accept: true,
            signature: String::new(),
            address: String::new(),
            anchor: None,
        });
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            ProtocolMessage::parse(&bytes),
            Err(MessageError::Invalid {
                msg_type: "proposalReply",
                ..
            })
        ));
    }

    #[test]
    fn test_cancel_requires_reason() {
        let msg = ProtocolMessage::Cancel(Cancel {
            base: base(),
            reason: 0,
        });
        let bytes = msg.to_bytes().unwrap();
        assert!(ProtocolMessage::parse(&bytes).is_err());
    }
}
