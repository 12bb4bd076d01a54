//! Anchor event records.
//!
//! The anchor is an external append-only log that witnesses agreement
//! creation and termination. Records carry a topic list whose first entry
//! names the event kind and whose trailing entry is a 32-byte
//! (64-hex-char) topic holding the agreement id in its low 16 bytes; the
//! data field carries the big-endian reason code in hex for termination
//! kinds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::message::AGREEMENT_ID_LEN;

/// Hex length of a 32-byte topic.
const TOPIC_LEN: usize = 64;

/// Errors from demarshaling anchor records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnchorError {
    /// The record's topic list is empty or its kind is unknown.
    #[error("unknown anchor event kind '{kind}'")]
    UnknownKind {
        /// The offending kind topic.
        kind: String,
    },

    /// The trailing topic is missing or not a well-formed id topic.
    #[error("anchor record has no usable agreement id topic")]
    BadAgreementTopic,

    /// The data field does not hold a hex reason code.
    #[error("anchor record data '{data}' is not a hex reason code")]
    BadReasonCode {
        /// The offending data field.
        data: String,
    },
}

/// The kinds of events the anchor emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorEventKind {
    /// An agreement was recorded.
    AgreementCreate,
    /// The consumer terminated the agreement.
    ConsumerTerm,
    /// The producer terminated the agreement.
    ProducerTerm,
    /// Fraud was reported.
    Fraud,
    /// The agreement was terminated for fraud.
    FraudTerm,
    /// An administrator terminated the agreement.
    AdminTerm,
}

impl AnchorEventKind {
    /// Wire topic string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgreementCreate => "AGREEMENT_CREATE",
            Self::ConsumerTerm => "CONSUMER_TERM",
            Self::ProducerTerm => "PRODUCER_TERM",
            Self::Fraud => "FRAUD",
            Self::FraudTerm => "FRAUD_TERM",
            Self::AdminTerm => "ADMIN_TERM",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "AGREEMENT_CREATE" => Some(Self::AgreementCreate),
            "CONSUMER_TERM" => Some(Self::ConsumerTerm),
            "PRODUCER_TERM" => Some(Self::ProducerTerm),
            "FRAUD" => Some(Self::Fraud),
            "FRAUD_TERM" => Some(Self::FraudTerm),
            "ADMIN_TERM" => Some(Self::AdminTerm),
            _ => None,
        }
    }

    /// Whether the kind ends an agreement.
    #[must_use]
    pub const fn is_termination(self) -> bool {
        !matches!(self, Self::AgreementCreate)
    }
}

/// A raw record as it appears on the anchor stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAnchorRecord {
    /// Topic list: `[kind, ..., agreementIdTopic]`.
    pub topics: Vec<String>,
    /// Big-endian reason code in hex; empty for create events.
    #[serde(default)]
    pub data: String,
}

impl RawAnchorRecord {
    /// Builds a create record for an agreement.
    #[must_use]
    pub fn create(agreement_id: &str) -> Self {
        Self {
            topics: vec![
                AnchorEventKind::AgreementCreate.as_str().to_string(),
                id_topic(agreement_id),
            ],
            data: String::new(),
        }
    }

    /// Builds a termination record for an agreement.
    #[must_use]
    pub fn terminate(kind: AnchorEventKind, agreement_id: &str, reason: u32) -> Self {
        Self {
            topics: vec![kind.as_str().to_string(), id_topic(agreement_id)],
            data: format!("{reason:x}"),
        }
    }
}

/// A demarshaled anchor event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorEvent {
    /// Event kind.
    pub kind: AnchorEventKind,
    /// The agreement the event references, lowercase hex.
    pub agreement_id: String,
    /// Reason code, for termination kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u64>,
}

impl AnchorEvent {
    /// Demarshals a raw record.
    ///
    /// # Errors
    ///
    /// [`AnchorError`] when the kind is unknown, the trailing topic is not
    /// an id topic, or a termination record carries a malformed reason.
    pub fn demarshal(raw: &RawAnchorRecord) -> Result<Self, AnchorError> {
        let kind_topic = raw.topics.first().ok_or_else(|| AnchorError::UnknownKind {
            kind: String::new(),
        })?;
        let kind = AnchorEventKind::parse(kind_topic).ok_or_else(|| AnchorError::UnknownKind {
            kind: kind_topic.clone(),
        })?;

        let id_topic = raw
            .topics
            .last()
            .filter(|_| raw.topics.len() >= 2)
            .ok_or(AnchorError::BadAgreementTopic)?;
        let agreement_id = extract_agreement_id(id_topic)?;

        let reason_code = if kind.is_termination() {
            let data = raw.data.trim_start_matches("0x");
            if data.is_empty() {
                None
            } else {
                Some(
                    u64::from_str_radix(data, 16).map_err(|_| AnchorError::BadReasonCode {
                        data: raw.data.clone(),
                    })?,
                )
            }
        } else {
            None
        };

        Ok(Self {
            kind,
            agreement_id,
            reason_code,
        })
    }
}

/// Embeds an agreement id in a 32-byte topic, left-padded with zeros.
#[must_use]
pub fn id_topic(agreement_id: &str) -> String {
    format!("{:0>width$}", agreement_id, width = TOPIC_LEN)
}

fn extract_agreement_id(topic: &str) -> Result<String, AnchorError> {
    let topic = topic.trim_start_matches("0x");
    if topic.len() != TOPIC_LEN || !topic.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AnchorError::BadAgreementTopic);
    }
    let (pad, id) = topic.split_at(TOPIC_LEN - AGREEMENT_ID_LEN);
    if pad.chars().any(|c| c != '0') {
        return Err(AnchorError::BadAgreementTopic);
    }
    Ok(id.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_create_round_trip() {
        let raw = RawAnchorRecord::create(ID);
        let ev = AnchorEvent::demarshal(&raw).unwrap();
        assert_eq!(ev.kind, AnchorEventKind::AgreementCreate);
        assert_eq!(ev.agreement_id, ID);
        assert_eq!(ev.reason_code, None);
    }

    #[test]
    fn test_terminate_round_trip() {
        let raw = RawAnchorRecord::terminate(AnchorEventKind::ConsumerTerm, ID, 204);
        let ev = AnchorEvent::demarshal(&raw).unwrap();
        assert_eq!(ev.kind, AnchorEventKind::ConsumerTerm);
        assert_eq!(ev.reason_code, Some(204));
        // 204 = 0xcc travels as big-endian hex.
        assert_eq!(raw.data, "cc");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let raw = RawAnchorRecord {
            topics: vec!["MYSTERY".into(), id_topic(ID)],
            data: String::new(),
        };
        assert!(matches!(
            AnchorEvent::demarshal(&raw),
            Err(AnchorError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_bad_id_topic_rejected() {
        let raw = RawAnchorRecord {
            topics: vec!["AGREEMENT_CREATE".into(), "abc".into()],
            data: String::new(),
        };
        assert!(matches!(
            AnchorEvent::demarshal(&raw),
            Err(AnchorError::BadAgreementTopic)
        ));
    }

    #[test]
    fn test_id_topic_is_left_padded() {
        let topic = id_topic(ID);
        assert_eq!(topic.len(), 64);
        assert!(topic.starts_with(&"0".repeat(32)));
        assert!(topic.ends_with(ID));
    }

    #[test]
    fn test_0x_prefixes_tolerated() {
        let raw = RawAnchorRecord {
            topics: vec![
                "PRODUCER_TERM".into(),
                format!("0x{}", id_topic(ID)),
            ],
            data: "0x64".into(),
        };
        let ev = AnchorEvent::demarshal(&raw).unwrap();
        assert_eq!(ev.agreement_id, ID);
        assert_eq!(ev.reason_code, Some(100));
    }
}
