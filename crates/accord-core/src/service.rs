//! Local service definitions and running instances.
//!
//! A *definition* describes a service the node can run: where it comes
//! from, the acceptable version range, its upgrade policy, and the input
//! variables it requires. An *instance* is one running copy, keyed by an
//! instance id that appears in container names and tracking the
//! agreements that depend on it.

use serde::{Deserialize, Serialize};

use crate::version::VersionRange;

/// One step of the dependency path that led to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePathElement {
    /// Service URL.
    pub spec_ref: String,
    /// Organization.
    pub org: String,
    /// Concrete version chosen.
    pub version: String,
}

/// When a newer service version may replace a running one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePolicy {
    /// Upgrade automatically when a newer version appears.
    #[serde(default)]
    pub auto_upgrade: bool,
    /// Cancel agreements immediately instead of waiting for natural
    /// termination.
    #[serde(default)]
    pub active_upgrade: bool,
}

/// An input variable a service requires before it can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputSpec {
    /// Variable name.
    pub name: String,
    /// Default applied when the operator supplies nothing; a variable
    /// without a default is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl UserInputSpec {
    /// Whether the operator must supply a value.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.default_value.is_none()
    }
}

/// A service the node can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Storage id.
    pub id: String,
    /// Service URL.
    pub spec_ref: String,
    /// Organization.
    pub org: String,
    /// Acceptable versions.
    pub version: VersionRange,
    /// Architecture.
    pub arch: String,
    /// Launched by node configuration rather than by an agreement.
    #[serde(default)]
    pub agreement_less: bool,
    /// Newest version published within the acceptable range, as last
    /// reported; drives the upgrade check.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub available_version: String,
    /// Upgrade policy.
    #[serde(default)]
    pub upgrade: UpgradePolicy,
    /// Input variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_inputs: Vec<UserInputSpec>,
}

impl ServiceDefinition {
    /// Names of required inputs that `supplied` does not cover.
    #[must_use]
    pub fn missing_inputs(&self, supplied: &[String]) -> Vec<String> {
        self.user_inputs
            .iter()
            .filter(|u| u.is_required() && !supplied.contains(&u.name))
            .map(|u| u.name.clone())
            .collect()
    }
}

/// A running copy of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Instance id; appears in container names.
    pub instance_id: String,
    /// Service URL.
    pub spec_ref: String,
    /// Organization.
    pub org: String,
    /// Concrete running version.
    pub version: String,
    /// Architecture.
    pub arch: String,
    /// Agreements depending on this instance.
    #[serde(default)]
    pub associated_agreements: Vec<String>,
    /// When execution began, seconds since the epoch.
    #[serde(default)]
    pub execution_start_time: u64,
    /// Classified failure code, when execution failed.
    #[serde(default)]
    pub execution_failure_code: u32,
    /// Failure diagnostic.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_failure_desc: String,
    /// When cleanup began; zero while running.
    #[serde(default)]
    pub cleanup_start_time: u64,
    /// Launched by configuration, not by an agreement.
    #[serde(default)]
    pub agreement_less: bool,
    /// Marked for replacement by a newer version.
    #[serde(default)]
    pub pending_upgrade: bool,
    /// How this instance was chosen, outermost dependency first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_path: Vec<ServicePathElement>,
}

impl ServiceInstance {
    /// Creates a fresh instance record.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        spec_ref: impl Into<String>,
        org: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            spec_ref: spec_ref.into(),
            org: org.into(),
            version: version.into(),
            arch: arch.into(),
            associated_agreements: Vec::new(),
            execution_start_time: 0,
            execution_failure_code: 0,
            execution_failure_desc: String::new(),
            cleanup_start_time: 0,
            agreement_less: false,
            pending_upgrade: false,
            parent_path: Vec::new(),
        }
    }

    /// Binds an agreement to the instance; duplicates are ignored.
    pub fn associate_agreement(&mut self, agreement_id: &str) {
        if !self
            .associated_agreements
            .iter()
            .any(|a| a == agreement_id)
        {
            self.associated_agreements.push(agreement_id.to_string());
        }
    }

    /// Unbinds an agreement; returns `true` when no agreements remain and
    /// the instance is not agreement-less (i.e. it is now garbage).
    pub fn release_agreement(&mut self, agreement_id: &str) -> bool {
        self.associated_agreements.retain(|a| a != agreement_id);
        self.associated_agreements.is_empty() && !self.agreement_less
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_inputs() {
        let def = ServiceDefinition {
            id: "svc-a".into(),
            spec_ref: "https://svc/a".into(),
            org: "myorg".into(),
            version: "1.0.0".parse().unwrap(),
            arch: "amd64".into(),
            agreement_less: false,
            available_version: String::new(),
            upgrade: UpgradePolicy::default(),
            user_inputs: vec![
                UserInputSpec {
                    name: "token".into(),
                    default_value: None,
                },
                UserInputSpec {
                    name: "rate".into(),
                    default_value: Some(serde_json::json!(5)),
                },
            ],
        };
        assert_eq!(def.missing_inputs(&[]), vec!["token".to_string()]);
        assert!(def.missing_inputs(&["token".to_string()]).is_empty());
    }

    #[test]
    fn test_agreement_association() {
        let mut inst = ServiceInstance::new("i1", "https://svc/a", "myorg", "1.2.0", "amd64");
        inst.associate_agreement("ag-1");
        inst.associate_agreement("ag-1");
        assert_eq!(inst.associated_agreements.len(), 1);
        assert!(inst.release_agreement("ag-1"));

        inst.agreement_less = true;
        inst.associate_agreement("ag-2");
        assert!(!inst.release_agreement("ag-2"));
    }
}
