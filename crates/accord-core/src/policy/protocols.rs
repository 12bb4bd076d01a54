//! Agreement protocol declarations and version negotiation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while intersecting protocol lists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolListError {
    /// The two policies support no protocol in common.
    #[error("no common agreement protocol between the two policies")]
    NoCommonProtocol,
}

/// An anchor a protocol entry is willing to witness agreements on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorBinding {
    /// Anchor kind, e.g. an event-log family name.
    pub kind: String,
    /// Instance name.
    pub name: String,
    /// Organization that operates the instance.
    #[serde(default)]
    pub org: String,
}

/// One supported agreement protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementProtocol {
    /// Protocol name.
    pub name: String,
    /// Highest protocol version this party speaks; `0` means "current".
    #[serde(default)]
    pub protocol_version: u32,
    /// Acceptable anchors, in preference order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<AnchorBinding>,
}

impl AgreementProtocol {
    /// Creates an entry for the named protocol at the current version.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol_version: 0,
            anchors: Vec::new(),
        }
    }

    /// The highest version this entry speaks, treating `0` as `current`.
    #[must_use]
    pub const fn max_version(&self, current: u32) -> u32 {
        if self.protocol_version == 0 {
            current
        } else {
            self.protocol_version
        }
    }
}

/// Intersects two protocol lists by name.
///
/// Each common protocol is returned with the negotiated version: the
/// minimum of the two sides' maximum supported versions. Anchor bindings
/// keep the first list's preference order, restricted to bindings the
/// second list also names (or all of the first list's when the second
/// declares none).
///
/// # Errors
///
/// [`ProtocolListError::NoCommonProtocol`] when no name is shared.
pub fn intersect(
    a: &[AgreementProtocol],
    b: &[AgreementProtocol],
    current_version: u32,
) -> Result<Vec<AgreementProtocol>, ProtocolListError> {
    let mut common = Vec::new();
    for left in a {
        let Some(right) = b.iter().find(|p| p.name == left.name) else {
            continue;
        };
        let version = left
            .max_version(current_version)
            .min(right.max_version(current_version));

        let anchors = if right.anchors.is_empty() {
            left.anchors.clone()
        } else if left.anchors.is_empty() {
            right.anchors.clone()
        } else {
            left.anchors
                .iter()
                .filter(|l| right.anchors.contains(l))
                .cloned()
                .collect()
        };

        common.push(AgreementProtocol {
            name: left.name.clone(),
            protocol_version: version,
            anchors,
        });
    }
    if common.is_empty() {
        return Err(ProtocolListError::NoCommonProtocol);
    }
    Ok(common)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiates_minimum_of_maximums() {
        let a = vec![AgreementProtocol {
            name: "accord-basic".into(),
            protocol_version: 2,
            anchors: vec![],
        }];
        let b = vec![AgreementProtocol {
            name: "accord-basic".into(),
            protocol_version: 3,
            anchors: vec![],
        }];
        let got = intersect(&a, &b, 2).unwrap();
        assert_eq!(got[0].protocol_version, 2);
    }

    #[test]
    fn test_zero_means_current() {
        let a = vec![AgreementProtocol::new("accord-basic")];
        let b = vec![AgreementProtocol {
            name: "accord-basic".into(),
            protocol_version: 1,
            anchors: vec![],
        }];
        let got = intersect(&a, &b, 2).unwrap();
        assert_eq!(got[0].protocol_version, 1);
    }

    #[test]
    fn test_no_common_protocol() {
        let a = vec![AgreementProtocol::new("accord-basic")];
        let b = vec![AgreementProtocol::new("other")];
        assert!(matches!(
            intersect(&a, &b, 2),
            Err(ProtocolListError::NoCommonProtocol)
        ));
    }

    #[test]
    fn test_anchor_preference_order_kept() {
        let bind = |name: &str| AnchorBinding {
            kind: "eventlog".into(),
            name: name.into(),
            org: "anchor-org".into(),
        };
        let a = vec![AgreementProtocol {
            name: "accord-basic".into(),
            protocol_version: 0,
            anchors: vec![bind("main"), bind("backup")],
        }];
        let b = vec![AgreementProtocol {
            name: "accord-basic".into(),
            protocol_version: 0,
            anchors: vec![bind("backup"), bind("main")],
        }];
        let got = intersect(&a, &b, 2).unwrap();
        assert_eq!(got[0].anchors[0].name, "main");
        assert_eq!(got[0].anchors.len(), 2);
    }
}
