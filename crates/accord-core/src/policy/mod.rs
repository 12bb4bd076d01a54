//! Policy documents and compatibility matching.
//!
//! A policy is a declarative statement of what a party will accept:
//! required services, supported agreement protocols, advertised properties,
//! constraints on the counter party, data-verification and node-health
//! terms, and (on the consumer side) the workloads to place. Policies are
//! immutable once registered; a change produces a new policy object and a
//! change event.
//!
//! # Matching
//!
//! [`match_policies`] evaluates a producer policy against a consumer
//! policy and yields the negotiated intersection from which an agreement
//! proposal is built. [`Policy::merge`] then produces the merged terms
//! document ("tsAndCs") that both parties sign.

pub mod api_spec;
pub mod data_verification;
pub mod manager;
pub mod node_health;
pub mod property;
pub mod protocols;
pub mod workload;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::api_spec::{ApiSpec, ApiSpecError};
use self::data_verification::DataVerification;
use self::node_health::NodeHealth;
use self::property::{merge_properties, Constraint, PropertyError, PropertyList};
use self::protocols::{AgreementProtocol, ProtocolListError};
use self::workload::{priority_order, Workload};

/// Why two policies fail to match.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MatchError {
    /// A counter-party constraint expression cannot be satisfied by the
    /// other side's advertised properties.
    #[error("incompatible properties: {side} constraints are not satisfied")]
    IncompatibleProperties {
        /// Which side's constraints failed, `producer` or `consumer`.
        side: &'static str,
    },

    /// A constraint expression could not be evaluated at all.
    #[error("constraint evaluation failed: {0}")]
    BadConstraint(#[from] PropertyError),

    /// No agreement protocol in common.
    #[error(transparent)]
    Protocol(#[from] ProtocolListError),

    /// No common service, or no common service version.
    #[error(transparent)]
    ApiSpec(#[from] ApiSpecError),

    /// The consumer policy offers no workload to place.
    #[error("consumer policy '{name}' has no workloads")]
    NoWorkload {
        /// Consumer policy name.
        name: String,
    },
}

/// Policy identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyHeader {
    /// Policy name, unique within its organization.
    pub name: String,
    /// Document format version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// High-availability partner declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaGroup {
    /// Ids of the partner nodes in the group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partners: Vec<String>,
}

/// A policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Identity.
    pub header: PolicyHeader,
    /// Pattern this policy was generated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    /// Required (consumer) or offered (producer) services.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_specs: Vec<ApiSpec>,
    /// Supported agreement protocols.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agreement_protocols: Vec<AgreementProtocol>,
    /// Workload choices (consumer side).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<Workload>,
    /// Advertised properties.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: PropertyList,
    /// Constraints the counter party's properties must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_party_properties: Option<Constraint>,
    /// Data verification terms.
    #[serde(default)]
    pub data_verification: DataVerification,
    /// Node health thresholds.
    #[serde(default)]
    pub node_health: NodeHealth,
    /// Maximum simultaneous non-archived agreements; `0` means unbounded
    /// (pattern-generated policies serve arbitrarily many nodes).
    #[serde(default)]
    pub max_agreements: u32,
    /// High-availability group, if the node belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_group: Option<HaGroup>,
}

impl Policy {
    /// Creates an empty policy with the given name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            header: PolicyHeader {
                name: name.into(),
                version: "2.0".into(),
            },
            ..Default::default()
        }
    }

    /// Effective agreement cap; a zero `max_agreements` means unbounded.
    #[must_use]
    pub const fn agreement_cap(&self) -> u32 {
        if self.max_agreements == 0 {
            u32::MAX
        } else {
            self.max_agreements
        }
    }

    /// Merges a matched producer/consumer pair into the terms document
    /// both parties sign.
    ///
    /// The caller supplies the outcome of [`match_policies`] plus the
    /// single chosen workload; the merged policy carries exactly one
    /// workload and exactly one agreement protocol, and caps itself at one
    /// agreement.
    #[must_use]
    pub fn merge(
        producer: &Self,
        consumer: &Self,
        chosen: &Workload,
        matched: &MatchResult,
    ) -> Self {
        Self {
            header: PolicyHeader {
                name: format!("{} merged with {}", producer.header.name, consumer.header.name),
                version: consumer.header.version.clone(),
            },
            pattern_id: consumer.pattern_id.clone(),
            api_specs: matched.api_specs.clone(),
            agreement_protocols: vec![matched.protocol.clone()],
            workloads: vec![chosen.clone()],
            properties: merge_properties(&producer.properties, &consumer.properties),
            counter_party_properties: None,
            data_verification: matched.data_verification.clone(),
            node_health: matched.node_health.clone(),
            max_agreements: 1,
            ha_group: producer.ha_group.clone(),
        }
    }
}

/// The negotiated intersection of a compatible policy pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Common protocols with negotiated versions, first is preferred.
    pub protocols: Vec<AgreementProtocol>,
    /// The preferred protocol (first of `protocols`).
    pub protocol: AgreementProtocol,
    /// Required services with tightest common version ranges.
    pub api_specs: Vec<ApiSpec>,
    /// Merged data verification terms.
    pub data_verification: DataVerification,
    /// Merged node health thresholds.
    pub node_health: NodeHealth,
    /// Consumer workloads in priority order.
    pub workloads: Vec<Workload>,
}

/// Evaluates compatibility of a producer policy with a consumer policy.
///
/// Checks counter-party constraints in both directions, intersects the
/// protocol lists and the API spec lists, merges data-verification and
/// node-health terms, and orders the consumer's workloads by priority.
///
/// # Errors
///
/// Returns the first [`MatchError`] encountered; constraint failures take
/// precedence over protocol and spec failures so that callers can
/// distinguish "wrong node" from "wrong software".
pub fn match_policies(
    producer: &Policy,
    consumer: &Policy,
    current_protocol_version: u32,
) -> Result<MatchResult, MatchError> {
    if let Some(constraint) = &consumer.counter_party_properties {
        if !constraint.satisfied_by(&producer.properties)? {
            return Err(MatchError::IncompatibleProperties { side: "consumer" });
        }
    }
    if let Some(constraint) = &producer.counter_party_properties {
        if !constraint.satisfied_by(&consumer.properties)? {
            return Err(MatchError::IncompatibleProperties { side: "producer" });
        }
    }

    let protocols = protocols::intersect(
        &consumer.agreement_protocols,
        &producer.agreement_protocols,
        current_protocol_version,
    )?;

    let api_specs = api_spec::intersect(&consumer.api_specs, &producer.api_specs)?;

    let workloads = priority_order(&consumer.workloads);
    if workloads.is_empty() {
        return Err(MatchError::NoWorkload {
            name: consumer.header.name.clone(),
        });
    }

    Ok(MatchResult {
        protocol: protocols[0].clone(),
        protocols,
        api_specs,
        data_verification: DataVerification::merge(
            &producer.data_verification,
            &consumer.data_verification,
        ),
        node_health: NodeHealth::merge(&producer.node_health, &consumer.node_health),
        workloads,
    })
}

#[cfg(test)]
mod tests {
    use super::property::{CompareOp, Property, PropertyValue};
    use super::workload::WorkloadPriority;
    use super::*;

    pub(crate) fn producer_policy() -> Policy {
        let mut p = Policy::named("device-svcA");
        p.api_specs = vec![ApiSpec::new(
            "https://svc/a",
            "myorg",
            "1.2.0".parse().unwrap(),
            "amd64",
        )];
        p.agreement_protocols = vec![AgreementProtocol::new("accord-basic")];
        p.properties = vec![
            Property::new("arch", PropertyValue::Text("amd64".into())),
            Property::new("ram", PropertyValue::Int(2048)),
        ];
        p.data_verification = DataVerification {
            enabled: true,
            ..Default::default()
        };
        p
    }

    pub(crate) fn consumer_policy() -> Policy {
        let mut c = Policy::named("workload-svcA");
        c.api_specs = vec![ApiSpec::new(
            "https://svc/a",
            "myorg",
            "[1.0.0,2.0.0)".parse().unwrap(),
            "amd64",
        )];
        c.agreement_protocols = vec![AgreementProtocol::new("accord-basic")];
        c.workloads = vec![Workload {
            workload_url: "https://wl/a".into(),
            org: "myorg".into(),
            version: "1.0.0".into(),
            arch: "amd64".into(),
            deployment: "{\"services\":{}}".into(),
            priority: WorkloadPriority::default(),
            ..Default::default()
        }];
        c.data_verification = DataVerification {
            enabled: true,
            url: "https://verify.example".into(),
            ..Default::default()
        };
        c.max_agreements = 1;
        c
    }

    #[test]
    fn test_match_happy_path() {
        let m = match_policies(&producer_policy(), &consumer_policy(), 2).unwrap();
        assert_eq!(m.protocol.name, "accord-basic");
        assert_eq!(m.protocol.protocol_version, 2);
        assert_eq!(m.api_specs[0].version.to_string(), "[1.2.0,2.0.0)");
        assert!(m.data_verification.enabled);
        assert_eq!(m.workloads.len(), 1);
    }

    #[test]
    fn test_match_version_incompatible() {
        let mut c = consumer_policy();
        c.api_specs[0].version = "[2.0.0,3.0.0)".parse().unwrap();
        assert!(matches!(
            match_policies(&producer_policy(), &c, 2),
            Err(MatchError::ApiSpec(ApiSpecError::NoCommonVersion { .. }))
        ));
    }

    #[test]
    fn test_match_rejects_unsatisfied_constraints() {
        let mut p = producer_policy();
        p.counter_party_properties = Some(Constraint::Require {
            name: "ram".into(),
            op: CompareOp::Gte,
            value: "4096".into(),
        });
        let mut c = consumer_policy();
        c.properties = vec![Property::new("ram", PropertyValue::Int(2048))];
        assert!(matches!(
            match_policies(&p, &c, 2),
            Err(MatchError::IncompatibleProperties { side: "producer" })
        ));
    }

    #[test]
    fn test_match_no_common_protocol() {
        let mut p = producer_policy();
        p.agreement_protocols = vec![AgreementProtocol::new("other")];
        assert!(matches!(
            match_policies(&p, &consumer_policy(), 2),
            Err(MatchError::Protocol(ProtocolListError::NoCommonProtocol))
        ));
    }

    #[test]
    fn test_match_symmetry_of_intersections() {
        // Swapping the sides must produce the same protocol set and the
        // same common version ranges whenever both directions match.
        let p = producer_policy();
        let c = consumer_policy();
        // Give the producer a workload too so the reversed match succeeds.
        let mut reversed_consumer = p.clone();
        reversed_consumer.workloads = c.workloads.clone();
        let forward = match_policies(&p, &c, 2).unwrap();
        let backward = match_policies(&c, &reversed_consumer, 2).unwrap();
        assert_eq!(forward.protocol.name, backward.protocol.name);
        assert_eq!(
            forward.protocol.protocol_version,
            backward.protocol.protocol_version
        );
        assert_eq!(forward.api_specs[0].version, backward.api_specs[0].version);
    }

    #[test]
    fn test_policy_round_trips_canonically() {
        let c = consumer_policy();
        let json = serde_json::to_string(&c).unwrap();
        let back: Policy = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
        assert_eq!(json, serde_json::to_string(&back).unwrap());
    }
}
