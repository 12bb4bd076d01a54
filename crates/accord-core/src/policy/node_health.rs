//! Node health expectations carried by a policy.

use serde::{Deserialize, Serialize};

/// Default seconds a node may miss heartbeats before it is degraded.
pub const DEFAULT_MISSING_HEARTBEAT_INTERVAL: u64 = 180;
/// Default seconds between agreement-status checks against the directory.
pub const DEFAULT_CHECK_AGREEMENT_STATUS: u64 = 300;

/// Health thresholds governing agreements with a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    /// Seconds without a directory heartbeat before the node is degraded.
    #[serde(default)]
    pub missing_heartbeat_interval: u64,
    /// Seconds between checks that the agreement still exists on the node.
    #[serde(default)]
    pub check_agreement_status: u64,
}

impl NodeHealth {
    /// Merges the two sides' thresholds, taking the stricter nonzero value
    /// of each and defaulting fields neither side set.
    #[must_use]
    pub fn merge(producer: &Self, consumer: &Self) -> Self {
        Self {
            missing_heartbeat_interval: stricter(
                producer.missing_heartbeat_interval,
                consumer.missing_heartbeat_interval,
                DEFAULT_MISSING_HEARTBEAT_INTERVAL,
            ),
            check_agreement_status: stricter(
                producer.check_agreement_status,
                consumer.check_agreement_status,
                DEFAULT_CHECK_AGREEMENT_STATUS,
            ),
        }
    }
}

fn stricter(a: u64, b: u64, default: u64) -> u64 {
    match (a, b) {
        (0, 0) => default,
        (0, x) | (x, 0) => x,
        (x, y) => x.min(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_takes_stricter_nonzero() {
        let p = NodeHealth {
            missing_heartbeat_interval: 60,
            check_agreement_status: 0,
        };
        let c = NodeHealth {
            missing_heartbeat_interval: 120,
            check_agreement_status: 600,
        };
        let m = NodeHealth::merge(&p, &c);
        assert_eq!(m.missing_heartbeat_interval, 60);
        assert_eq!(m.check_agreement_status, 600);
    }

    #[test]
    fn test_merge_defaults_when_unset() {
        let m = NodeHealth::merge(&NodeHealth::default(), &NodeHealth::default());
        assert_eq!(
            m.missing_heartbeat_interval,
            DEFAULT_MISSING_HEARTBEAT_INTERVAL
        );
        assert_eq!(m.check_agreement_status, DEFAULT_CHECK_AGREEMENT_STATUS);
    }
}
