//! Data verification and metering terms.

use serde::{Deserialize, Serialize};

/// Default seconds of missing data tolerated before cancellation.
pub const DEFAULT_NO_DATA_INTERVAL: u64 = 300;
/// Default seconds between polls of the verification endpoint.
pub const DEFAULT_CHECK_RATE: u64 = 15;

/// Metering terms: how the producer is credited for verified data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    /// Tokens credited per time unit.
    #[serde(default)]
    pub tokens: u64,
    /// Time unit, e.g. `min`, `hour`, `day`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub per_time_unit: String,
    /// Seconds between metering notifications.
    #[serde(default)]
    pub notification_interval: u64,
}

impl Meter {
    /// Returns `true` when no metering is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens == 0 && self.per_time_unit.is_empty()
    }
}

/// Data verification terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVerification {
    /// Whether data verification applies to the agreement at all.
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint the consumer polls for evidence of data flow.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Basic-auth user for the endpoint, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url_user: String,
    /// Seconds of silence tolerated before the agreement is cancelled.
    #[serde(default)]
    pub interval: u64,
    /// Seconds between endpoint polls.
    #[serde(default)]
    pub check_rate: u64,
    /// Metering terms tied to verified data.
    #[serde(default, skip_serializing_if = "Meter::is_empty")]
    pub metering: Meter,
}

impl DataVerification {
    /// Merges producer and consumer terms into the agreement's terms.
    ///
    /// Verification applies only when both sides enable it; the consumer's
    /// endpoint and metering win, and zero intervals take the defaults.
    #[must_use]
    pub fn merge(producer: &Self, consumer: &Self) -> Self {
        if !(producer.enabled && consumer.enabled) {
            return Self::default();
        }
        let mut merged = consumer.clone();
        if merged.url.is_empty() {
            merged.url = producer.url.clone();
            merged.url_user = producer.url_user.clone();
        }
        if merged.interval == 0 {
            merged.interval = DEFAULT_NO_DATA_INTERVAL;
        }
        if merged.check_rate == 0 {
            merged.check_rate = DEFAULT_CHECK_RATE;
        }
        if merged.metering.is_empty() {
            merged.metering = producer.metering.clone();
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_requires_both_enabled() {
        let on = DataVerification {
            enabled: true,
            url: "https://verify.example".into(),
            ..Default::default()
        };
        let off = DataVerification::default();
        assert!(!DataVerification::merge(&on, &off).enabled);
        assert!(!DataVerification::merge(&off, &on).enabled);
    }

    #[test]
    fn test_merge_fills_defaults() {
        let producer = DataVerification {
            enabled: true,
            url: "https://producer.example".into(),
            ..Default::default()
        };
        let consumer = DataVerification {
            enabled: true,
            ..Default::default()
        };
        let merged = DataVerification::merge(&producer, &consumer);
        assert_eq!(merged.url, "https://producer.example");
        assert_eq!(merged.interval, DEFAULT_NO_DATA_INTERVAL);
        assert_eq!(merged.check_rate, DEFAULT_CHECK_RATE);
    }
}
