//! Record types with no richer home: the node record and the event log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration lifecycle of the node itself.
///
/// Transitions are one-way; `Configuring -> Configured` is the only
/// in-band transition the configuration API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigState {
    /// No registration recorded.
    Unconfigured,
    /// Registration recorded, services being configured.
    Configuring,
    /// Services configured; producer policies exist.
    Configured,
    /// Tear-down in progress.
    Unconfiguring,
}

impl ConfigState {
    /// Wire string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Unconfiguring => "unconfiguring",
        }
    }

    /// Whether a requested in-band change is legal.
    ///
    /// Noop transitions are legal; the only real change allowed through
    /// the API is `Configuring -> Configured`.
    #[must_use]
    pub fn valid_change(self, to: Self) -> bool {
        self == to || (self == Self::Configuring && to == Self::Configured)
    }
}

impl std::fmt::Display for ConfigState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfigState {
    type Err = BadConfigState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfigured" => Ok(Self::Unconfigured),
            "configuring" => Ok(Self::Configuring),
            "configured" => Ok(Self::Configured),
            "unconfiguring" => Ok(Self::Unconfiguring),
            _ => Err(BadConfigState {
                input: s.to_string(),
            }),
        }
    }
}

/// An unrecognized configuration state string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("'{input}' is not a configuration state")]
pub struct BadConfigState {
    /// The offending input.
    pub input: String,
}

/// The local node's registration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Organization.
    pub org: String,
    /// Node id within the organization.
    pub id: String,
    /// Operator-facing name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Directory token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Pattern the node serves, `org/name` form, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Configuration lifecycle state.
    pub config_state: ConfigState,
}

/// Severity of an event log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSeverity {
    /// Routine operational record.
    Info,
    /// Degraded but continuing.
    Warn,
    /// An operation failed.
    Error,
}

impl LogSeverity {
    /// Wire string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Event log categories.
pub mod category {
    /// Node configuration and registration.
    pub const NODE_CONFIG: &str = "node_config";
    /// Agreement lifecycle.
    pub const AGREEMENT: &str = "agreement";
    /// Policy registration and drift.
    pub const POLICY: &str = "policy";
    /// Store failures.
    pub const DATABASE: &str = "database";
    /// Directory interaction.
    pub const EXCHANGE: &str = "exchange";
    /// Anchor interaction.
    pub const ANCHOR: &str = "anchor";
    /// Service lifecycle.
    pub const SERVICE: &str = "service";
}

/// One record of the append-only operator event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogRecord {
    /// Monotonic record id, assigned on append.
    pub record_id: u64,
    /// Seconds since the epoch.
    pub timestamp: u64,
    /// Severity class.
    pub severity: LogSeverity,
    /// Category, one of [`category`]'s constants.
    pub category: String,
    /// Operator-facing message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_state_changes() {
        use ConfigState::{Configured, Configuring, Unconfigured, Unconfiguring};
        assert!(Configuring.valid_change(Configured));
        assert!(Configured.valid_change(Configured));
        assert!(!Unconfigured.valid_change(Configured));
        assert!(!Configured.valid_change(Configuring));
        assert!(!Unconfiguring.valid_change(Configured));
    }

    #[test]
    fn test_config_state_strings() {
        assert_eq!(ConfigState::Configuring.to_string(), "configuring");
        assert_eq!(
            "configured".parse::<ConfigState>().unwrap(),
            ConfigState::Configured
        );
        assert!("bogus".parse::<ConfigState>().is_err());
    }
}
