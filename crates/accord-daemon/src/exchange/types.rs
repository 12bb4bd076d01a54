//! Wire types of the directory service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use accord_core::policy::data_verification::DataVerification;
use accord_core::policy::node_health::NodeHealth;
use accord_core::policy::property::PropertyList;
use accord_core::policy::protocols::AgreementProtocol;
use accord_core::policy::workload::WorkloadPriority;

/// Splits a full party id (`org/id`) into its parts.
#[must_use]
pub fn split_party_id(full: &str) -> (&str, &str) {
    full.split_once('/').unwrap_or(("", full))
}

/// A service a node has registered with the directory.
///
/// `policy` carries the node's generated producer policy for the service,
/// canonical JSON, so consumers can evaluate compatibility without another
/// round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredService {
    /// Service URL.
    pub url: String,
    /// Organization of the service.
    #[serde(default)]
    pub org: String,
    /// Concrete version offered.
    #[serde(default)]
    pub version: String,
    /// Architecture.
    #[serde(default)]
    pub arch: String,
    /// Advertised properties.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: PropertyList,
    /// The producer policy for this service, canonical JSON.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,
}

/// A node record as returned by `GET /orgs/{org}/nodes/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Operator-facing name.
    #[serde(default)]
    pub name: String,
    /// Pattern the node declared, `org/name` form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    /// Services the node runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registered_services: Vec<RegisteredService>,
    /// Message endpoint override; empty means the directory mailbox.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg_end_point: String,
    /// Published mailbox public key, hex.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    /// Architecture.
    #[serde(default)]
    pub arch: String,
    /// Seconds since the epoch of the last heartbeat.
    #[serde(default)]
    pub last_heartbeat: u64,
}

/// Body of `PUT /orgs/{org}/nodes/{id}`.
pub type NodePut = Node;

/// Body of `POST /orgs/{org}/search/nodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSearchRequest {
    /// Service URLs the nodes must run.
    pub service_urls: Vec<String>,
    /// Skip nodes silent for longer than this; `0` disables the filter.
    #[serde(default)]
    pub seconds_stale: u64,
    /// Pagination start.
    #[serde(default)]
    pub start_index: u64,
    /// Page size; `0` means unbounded.
    #[serde(default)]
    pub num_entries: u64,
}

/// Body of `POST /orgs/{org}/patterns/{pat}/search`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternSearchRequest {
    /// The workload service being placed.
    pub service_url: String,
    /// Skip nodes silent for longer than this; `0` disables the filter.
    #[serde(default)]
    pub seconds_stale: u64,
    /// Pagination start.
    #[serde(default)]
    pub start_index: u64,
    /// Page size; `0` means unbounded.
    #[serde(default)]
    pub num_entries: u64,
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Full node id, `org/id` form.
    pub id: String,
    /// Operator-facing name.
    #[serde(default)]
    pub name: String,
    /// Published mailbox public key, hex.
    #[serde(default)]
    pub public_key: String,
    /// Message endpoint override.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg_end_point: String,
    /// Services the node runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registered_services: Vec<RegisteredService>,
}

/// One version choice within a pattern service entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternServiceVersion {
    /// Version to deploy.
    pub version: String,
    /// Priority/retry terms.
    #[serde(default)]
    pub priority: WorkloadPriority,
    /// Opaque deployment configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment: String,
    /// Detached signature over the deployment configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_signature: String,
}

/// One service entry of a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternService {
    /// Service URL.
    pub service_url: String,
    /// Organization of the service.
    pub service_org: String,
    /// Architecture.
    pub service_arch: String,
    /// Deployable versions, priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_versions: Vec<PatternServiceVersion>,
    /// Launched by configuration, never by an agreement.
    #[serde(default)]
    pub agreement_less: bool,
    /// Data verification defaults for agreements over this service.
    #[serde(default)]
    pub data_verification: DataVerification,
    /// Node health defaults.
    #[serde(default)]
    pub node_health: NodeHealth,
}

/// A pattern definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    /// Operator-facing label.
    #[serde(default)]
    pub label: String,
    /// Bundled services.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<PatternService>,
    /// Protocol defaults for agreements over this pattern.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agreement_protocols: Vec<AgreementProtocol>,
}

/// Response of `GET /orgs/{org}/patterns`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternsResponse {
    /// Pattern name (unqualified) to definition.
    #[serde(default)]
    pub patterns: BTreeMap<String, Pattern>,
}

/// An agbot record as returned by `GET /orgs/{org}/agbots/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agbot {
    /// Operator-facing name.
    #[serde(default)]
    pub name: String,
    /// Published mailbox public key, hex.
    #[serde(default)]
    pub public_key: String,
    /// Message endpoint override.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg_end_point: String,
}

/// A pattern assignment served by an agbot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServedPattern {
    /// Organization the pattern lives in.
    pub pattern_org: String,
    /// Pattern name.
    pub pattern: String,
}

/// Body of `POST /orgs/{org}/{nodes|agbots}/{id}/msgs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageBody {
    /// The sealed envelope, serialized.
    pub message: String,
    /// Seconds the directory retains the message.
    pub ttl: u64,
}

/// One mailbox entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxMessage {
    /// Directory-assigned id, used to delete after processing.
    pub msg_id: u64,
    /// Sender, `org/id` form.
    #[serde(default)]
    pub sender: String,
    /// The sealed envelope, serialized.
    pub message: String,
    /// Seconds since the epoch the message was posted.
    #[serde(default)]
    pub time_sent: u64,
}

/// Response of the mailbox drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxResponse {
    /// Pending messages, oldest first.
    #[serde(default)]
    pub messages: Vec<MailboxMessage>,
}

/// Body of the node-health search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthRequest {
    /// Only nodes that changed since this time, seconds since the epoch.
    #[serde(default)]
    pub since: u64,
    /// Organizations to report on.
    #[serde(default)]
    pub node_orgs: Vec<String>,
}

/// Health facts for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthStatus {
    /// Seconds since the epoch of the last heartbeat.
    #[serde(default)]
    pub last_heartbeat: u64,
    /// Ids of agreements the node has recorded with the directory.
    #[serde(default)]
    pub agreements: Vec<String>,
}

/// Response of the node-health search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealthResponse {
    /// Full node id to health facts.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeHealthStatus>,
}

/// Agreement state the node publishes to the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgreementState {
    /// Lifecycle state string.
    pub state: String,
    /// Workload service URL the agreement places.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_party_id() {
        assert_eq!(split_party_id("myorg/node1"), ("myorg", "node1"));
        assert_eq!(split_party_id("bare"), ("", "bare"));
    }

    #[test]
    fn test_node_wire_form() {
        let node = Node {
            name: "edge".into(),
            pattern: "myorg/edge-pattern".into(),
            public_key: "ab".repeat(32),
            arch: "amd64".into(),
            last_heartbeat: 1_700_000_000,
            ..Default::default()
        };
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"publicKey\""));
        assert!(json.contains("\"lastHeartbeat\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }
}
