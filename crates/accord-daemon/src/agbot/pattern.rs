//! Generation of consumer policies from served patterns.

use accord_core::policy::api_spec::ApiSpec;
use accord_core::policy::protocols::AgreementProtocol;
use accord_core::policy::workload::Workload;
use accord_core::policy::Policy;
use accord_core::protocol::PROTOCOL_NAME;
use accord_core::version::{Version, VersionRange};

use crate::exchange::types::{Pattern, PatternService, ServedPattern};

/// The deterministic name of the policy generated for one pattern service.
#[must_use]
pub fn pattern_policy_name(pattern_org: &str, pattern_name: &str, service_url: &str) -> String {
    // Service URLs make poor identifiers; keep the tail and sanitize.
    let tail = service_url
        .rsplit('/')
        .next()
        .unwrap_or(service_url)
        .replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "-");
    format!("{pattern_org}_{pattern_name}_{tail}")
}

/// Builds the consumer policy for one service entry of a served pattern.
///
/// Returns `None` when the entry has no deployable versions. The policy
/// accepts any service version from the lowest one the pattern deploys,
/// carries one workload choice per pattern version (priority order
/// preserved), and is unbounded in agreements so it can serve the whole
/// fleet.
#[must_use]
pub fn policy_from_pattern_service(
    assignment: &ServedPattern,
    pattern_name: &str,
    pattern: &Pattern,
    service: &PatternService,
) -> Option<Policy> {
    let mut versions: Vec<Version> = service
        .service_versions
        .iter()
        .filter_map(|v| v.version.parse().ok())
        .collect();
    versions.sort_unstable();
    let lowest = versions.first().copied()?;

    let mut policy = Policy::named(pattern_policy_name(
        &assignment.pattern_org,
        pattern_name,
        &service.service_url,
    ));
    policy.pattern_id = Some(format!("{}/{pattern_name}", assignment.pattern_org));
    policy.api_specs = vec![ApiSpec::new(
        service.service_url.clone(),
        service.service_org.clone(),
        VersionRange {
            min: lowest,
            min_inclusive: true,
            max: None,
            max_inclusive: false,
        },
        service.service_arch.clone(),
    )];
    policy.agreement_protocols = if pattern.agreement_protocols.is_empty() {
        vec![AgreementProtocol::new(PROTOCOL_NAME)]
    } else {
        pattern.agreement_protocols.clone()
    };
    policy.workloads = service
        .service_versions
        .iter()
        .map(|v| Workload {
            workload_url: service.service_url.clone(),
            org: service.service_org.clone(),
            version: v.version.clone(),
            arch: service.service_arch.clone(),
            deployment: v.deployment.clone(),
            deployment_signature: v.deployment_signature.clone(),
            priority: v.priority.clone(),
        })
        .collect();
    policy.data_verification = service.data_verification.clone();
    policy.node_health = service.node_health.clone();
    // Unbounded: one pattern policy serves arbitrarily many nodes.
    policy.max_agreements = 0;
    Some(policy)
}
