//! Required-service references and their intersection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::{VersionError, VersionRange};

/// Errors raised while intersecting API spec lists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiSpecError {
    /// The two lists reference no common service.
    #[error("no common service between the two policies")]
    NoCommonApiSpec,

    /// A common service exists but its version ranges do not overlap.
    #[error("no common version for service '{spec_ref}': {source}")]
    NoCommonVersion {
        /// Service URL of the conflicting spec.
        spec_ref: String,
        /// Underlying range failure.
        #[source]
        source: VersionError,
    },
}

/// A reference to a named, versioned service a workload requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    /// Service URL.
    pub spec_ref: String,
    /// Organization the service is defined in.
    pub org: String,
    /// Acceptable version range.
    pub version: VersionRange,
    /// Whether the service demands exclusive access on the node.
    #[serde(default)]
    pub exclusive_access: bool,
    /// Hardware architecture.
    pub arch: String,
}

impl ApiSpec {
    /// Creates a spec accepting the given range.
    #[must_use]
    pub fn new(
        spec_ref: impl Into<String>,
        org: impl Into<String>,
        version: VersionRange,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            spec_ref: spec_ref.into(),
            org: org.into(),
            version,
            exclusive_access: false,
            arch: arch.into(),
        }
    }

    /// Returns `true` when both specs name the same service on the same
    /// architecture.
    #[must_use]
    pub fn same_service(&self, other: &Self) -> bool {
        self.spec_ref == other.spec_ref && self.org == other.org && self.arch == other.arch
    }
}

/// Intersects two spec lists.
///
/// Every spec in `required` must be matched by a spec in `offered` naming
/// the same service and architecture, and the version ranges must overlap.
/// The result carries the tightest common range for each required service.
///
/// Symmetric in the ranges it produces: swapping the arguments yields the
/// same ranges for the same services as long as both directions cover each
/// other's services.
///
/// # Errors
///
/// [`ApiSpecError::NoCommonApiSpec`] when some required service is absent
/// from `offered`; [`ApiSpecError::NoCommonVersion`] when ranges do not
/// overlap.
pub fn intersect(required: &[ApiSpec], offered: &[ApiSpec]) -> Result<Vec<ApiSpec>, ApiSpecError> {
    let mut common = Vec::with_capacity(required.len());
    for want in required {
        let Some(have) = offered.iter().find(|o| o.same_service(want)) else {
            return Err(ApiSpecError::NoCommonApiSpec);
        };
        let range =
            want.version
                .common_range(&have.version)
                .map_err(|source| ApiSpecError::NoCommonVersion {
                    spec_ref: want.spec_ref.clone(),
                    source,
                })?;
        let mut merged = want.clone();
        merged.version = range;
        merged.exclusive_access = want.exclusive_access || have.exclusive_access;
        common.push(merged);
    }
    if common.is_empty() {
        return Err(ApiSpecError::NoCommonApiSpec);
    }
    Ok(common)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(url: &str, range: &str, arch: &str) -> ApiSpec {
        ApiSpec::new(url, "myorg", range.parse().unwrap(), arch)
    }

    #[test]
    fn test_intersect_happy_path() {
        let required = vec![spec("https://svc/a", "[1.0.0,2.0.0)", "amd64")];
        let offered = vec![spec("https://svc/a", "1.2.0", "amd64")];
        let got = intersect(&required, &offered).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].version.to_string(), "[1.2.0,2.0.0)");
    }

    #[test]
    fn test_intersect_no_common_service() {
        let required = vec![spec("https://svc/a", "1.0.0", "amd64")];
        let offered = vec![spec("https://svc/b", "1.0.0", "amd64")];
        assert!(matches!(
            intersect(&required, &offered),
            Err(ApiSpecError::NoCommonApiSpec)
        ));
    }

    #[test]
    fn test_intersect_arch_mismatch_is_no_common_service() {
        let required = vec![spec("https://svc/a", "1.0.0", "amd64")];
        let offered = vec![spec("https://svc/a", "1.0.0", "arm64")];
        assert!(matches!(
            intersect(&required, &offered),
            Err(ApiSpecError::NoCommonApiSpec)
        ));
    }

    #[test]
    fn test_intersect_no_common_version() {
        let required = vec![spec("https://svc/a", "[2.0.0,3.0.0)", "amd64")];
        let offered = vec![spec("https://svc/a", "[1.2.0,1.3.0)", "amd64")];
        assert!(matches!(
            intersect(&required, &offered),
            Err(ApiSpecError::NoCommonVersion { .. })
        ));
    }

    #[test]
    fn test_intersect_is_symmetric_on_ranges() {
        let a = vec![spec("https://svc/a", "[1.0.0,3.0.0)", "amd64")];
        let b = vec![spec("https://svc/a", "[2.0.0,4.0.0)", "amd64")];
        let ab = intersect(&a, &b).unwrap();
        let ba = intersect(&b, &a).unwrap();
        assert_eq!(ab[0].version, ba[0].version);
    }
}
