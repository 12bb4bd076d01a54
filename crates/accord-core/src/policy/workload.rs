//! Workload choices and priority-ordered selection.

use serde::{Deserialize, Serialize};

/// Retry/priority terms for one workload choice.
///
/// A lower `priority_value` is a higher priority. A workload is abandoned
/// for the next choice when it fails `retries` times within
/// `retry_durations` seconds; after `verified_durations` seconds of
/// verified execution the failure count resets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPriority {
    /// Priority rank; lower is tried first. `0` means unprioritized.
    #[serde(default)]
    pub priority_value: u32,
    /// Failures tolerated within the retry window.
    #[serde(default)]
    pub retries: u32,
    /// Retry window, seconds.
    #[serde(default)]
    pub retry_durations: u64,
    /// Seconds of verified execution that reset the failure count.
    #[serde(default)]
    pub verified_durations: u64,
}

/// One runnable workload a consumer policy offers to place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Workload service URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_url: String,
    /// Organization the workload is defined in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org: String,
    /// Workload version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Target architecture.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    /// Opaque deployment configuration handed to the container runtime.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment: String,
    /// Detached signature over the deployment configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_signature: String,
    /// Priority/retry terms.
    #[serde(default)]
    pub priority: WorkloadPriority,
}

impl Workload {
    /// Returns `true` when the choices name the same workload version.
    #[must_use]
    pub fn same_workload(&self, other: &Self) -> bool {
        self.workload_url == other.workload_url
            && self.org == other.org
            && self.version == other.version
            && self.arch == other.arch
    }
}

/// Orders workload choices by priority, lowest `priority_value` first.
///
/// Unprioritized entries (`priority_value == 0`) keep their relative order
/// after all prioritized entries.
#[must_use]
pub fn priority_order(workloads: &[Workload]) -> Vec<Workload> {
    let mut prioritized: Vec<Workload> = workloads
        .iter()
        .filter(|w| w.priority.priority_value != 0)
        .cloned()
        .collect();
    prioritized.sort_by_key(|w| w.priority.priority_value);
    prioritized.extend(
        workloads
            .iter()
            .filter(|w| w.priority.priority_value == 0)
            .cloned(),
    );
    prioritized
}

/// Picks the next workload to attempt.
///
/// `attempts` maps a workload's position in `ordered` to the number of
/// failed attempts recorded inside the current retry window; a choice whose
/// retries are exhausted is skipped. Returns the index into `ordered`.
#[must_use]
pub fn next_choice(ordered: &[Workload], attempts: &[u32]) -> Option<usize> {
    for (i, w) in ordered.iter().enumerate() {
        let used = attempts.get(i).copied().unwrap_or(0);
        if w.priority.priority_value == 0 || used <= w.priority.retries {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wl(url: &str, prio: u32, retries: u32) -> Workload {
        Workload {
            workload_url: url.into(),
            org: "myorg".into(),
            version: "1.0.0".into(),
            arch: "amd64".into(),
            priority: WorkloadPriority {
                priority_value: prio,
                retries,
                retry_durations: 3600,
                verified_durations: 52,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_order_lowest_first() {
        let ws = vec![wl("b", 50, 1), wl("a", 10, 1), wl("c", 0, 0)];
        let ordered = priority_order(&ws);
        assert_eq!(ordered[0].workload_url, "a");
        assert_eq!(ordered[1].workload_url, "b");
        assert_eq!(ordered[2].workload_url, "c");
    }

    #[test]
    fn test_next_choice_skips_exhausted() {
        let ordered = priority_order(&[wl("a", 10, 1), wl("b", 20, 2)]);
        // "a" has burned both its attempts (retries=1 means 2 tries total).
        assert_eq!(next_choice(&ordered, &[2, 0]), Some(1));
        assert_eq!(next_choice(&ordered, &[0, 0]), Some(0));
        assert_eq!(next_choice(&ordered, &[2, 3]), None);
    }
}
