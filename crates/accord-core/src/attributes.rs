//! Per-service configuration attributes.
//!
//! Attributes are polymorphic configuration records attached either to a
//! specific service (by URL and organization) or globally to the node.
//! The node worker folds them into the producer policies it generates:
//! compute and property attributes become advertised properties,
//! counter-party attributes become constraints, metering and protocol
//! attributes become the corresponding policy sections, and user-input
//! attributes satisfy a service's required variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::property::{Constraint, PropertyList};
use crate::policy::protocols::AgreementProtocol;

/// A service the attribute is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service URL.
    pub url: String,
    /// Organization of the service.
    pub org: String,
}

/// The type-specific payload of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AttributeVariant {
    /// CPU/memory reservation advertised to consumers.
    Compute {
        /// CPUs reserved.
        cpus: i64,
        /// RAM in megabytes.
        ram: i64,
    },
    /// High-availability partner declaration.
    Ha {
        /// Partner node ids.
        partners: Vec<String>,
    },
    /// Metering expectations for agreements over the service.
    Metering {
        /// Tokens per time unit.
        tokens: u64,
        /// Time unit name.
        per_time_unit: String,
        /// Seconds between notifications.
        notification_interval: u64,
    },
    /// Constraints on the counter party.
    CounterPartyProperty {
        /// The constraint expression.
        expression: Constraint,
    },
    /// Free-form advertised properties.
    Property {
        /// The properties to advertise.
        mappings: PropertyList,
    },
    /// Agreement protocols the service insists on.
    AgreementProtocol {
        /// Supported protocols in preference order.
        protocols: Vec<AgreementProtocol>,
    },
    /// Values for a service's required input variables.
    UserInput {
        /// Variable name to value.
        inputs: BTreeMap<String, serde_json::Value>,
    },
}

impl AttributeVariant {
    /// Wire name of the variant.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Compute { .. } => "compute",
            Self::Ha { .. } => "ha",
            Self::Metering { .. } => "metering",
            Self::CounterPartyProperty { .. } => "counterPartyProperty",
            Self::Property { .. } => "property",
            Self::AgreementProtocol { .. } => "agreementProtocol",
            Self::UserInput { .. } => "userInput",
        }
    }
}

/// A stored attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    /// Storage id.
    pub id: String,
    /// Operator-facing label.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Whether the attribute is advertised to the directory.
    #[serde(default)]
    pub publishable: bool,
    /// Whether the attribute stays on the node (never in policies).
    #[serde(default)]
    pub host_only: bool,
    /// Services the attribute applies to; empty means global.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_specs: Vec<ServiceSpec>,
    /// Payload.
    #[serde(flatten)]
    pub variant: AttributeVariant,
}

impl Attribute {
    /// Returns `true` when the attribute applies to the given service.
    #[must_use]
    pub fn applies_to(&self, url: &str, org: &str) -> bool {
        self.service_specs.is_empty()
            || self
                .service_specs
                .iter()
                .any(|s| s.url == url && s.org == org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_attribute_applies_everywhere() {
        let attr = Attribute {
            id: "a1".into(),
            label: String::new(),
            publishable: true,
            host_only: false,
            service_specs: vec![],
            variant: AttributeVariant::Compute { cpus: 1, ram: 128 },
        };
        assert!(attr.applies_to("https://svc/a", "myorg"));
        assert!(attr.applies_to("https://svc/b", "other"));
    }

    #[test]
    fn test_scoped_attribute() {
        let attr = Attribute {
            id: "a2".into(),
            label: String::new(),
            publishable: false,
            host_only: false,
            service_specs: vec![ServiceSpec {
                url: "https://svc/a".into(),
                org: "myorg".into(),
            }],
            variant: AttributeVariant::UserInput {
                inputs: BTreeMap::new(),
            },
        };
        assert!(attr.applies_to("https://svc/a", "myorg"));
        assert!(!attr.applies_to("https://svc/a", "other"));
        assert!(!attr.applies_to("https://svc/b", "myorg"));
    }

    #[test]
    fn test_tagged_wire_form() {
        let attr = Attribute {
            id: "a3".into(),
            label: "meter".into(),
            publishable: true,
            host_only: false,
            service_specs: vec![],
            variant: AttributeVariant::Metering {
                tokens: 2,
                per_time_unit: "min".into(),
                notification_interval: 30,
            },
        };
        let json = serde_json::to_string(&attr).unwrap();
        assert!(json.contains("\"type\":\"metering\""));
        let back: Attribute = serde_json::from_str(&json).unwrap();
        assert_eq!(attr, back);
    }
}
