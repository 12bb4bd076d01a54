//! Version numbers and version range expressions.
//!
//! Policies constrain the services they reference with range expressions.
//! A well-formed expression is either a single version `x.y.z`, which is
//! shorthand for `[x.y.z,INFINITY)`, or a bounded interval with explicit
//! inclusive/exclusive bounds such as `[1.0.0,2.0.0)`. Up to three numeric
//! components are accepted; missing components are zero.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Keyword accepted as an unbounded upper limit in range expressions.
pub const INFINITY: &str = "INFINITY";

/// Errors produced while parsing or intersecting version expressions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionError {
    /// A version string was not of the form `x[.y[.z]]`.
    #[error("invalid version '{input}'")]
    InvalidVersion {
        /// The offending input.
        input: String,
    },

    /// A range expression was malformed.
    #[error("invalid version range expression '{input}'")]
    InvalidRange {
        /// The offending input.
        input: String,
    },

    /// Two ranges have no common interval.
    #[error("no intersection between '{left}' and '{right}'")]
    NoIntersection {
        /// Left range, in canonical form.
        left: String,
        /// Right range, in canonical form.
        right: String,
    },
}

/// A three-component version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl Version {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion {
            input: s.to_string(),
        };

        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }

        let mut nums = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(invalid());
            }
            nums[i] = part.parse::<u64>().map_err(|_| invalid())?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

/// A half-open or closed interval over versions.
///
/// The upper bound may be absent (unbounded). Serialized as the textual
/// expression it was parsed from, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    /// Lower bound.
    pub min: Version,
    /// Whether the lower bound itself is included.
    pub min_inclusive: bool,
    /// Upper bound; `None` means unbounded.
    pub max: Option<Version>,
    /// Whether the upper bound itself is included.
    pub max_inclusive: bool,
}

impl VersionRange {
    /// The unbounded range `[0.0.0,INFINITY)`.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            min: Version::new(0, 0, 0),
            min_inclusive: true,
            max: None,
            max_inclusive: false,
        }
    }

    /// The range containing exactly one version, `[v,v]`.
    #[must_use]
    pub const fn exact(v: Version) -> Self {
        Self {
            min: v,
            min_inclusive: true,
            max: Some(v),
            max_inclusive: true,
        }
    }

    /// Returns `true` if `v` lies within the range.
    #[must_use]
    pub fn contains(&self, v: &Version) -> bool {
        match v.cmp(&self.min) {
            Ordering::Less => return false,
            Ordering::Equal if !self.min_inclusive => return false,
            _ => {}
        }
        if let Some(max) = &self.max {
            match v.cmp(max) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.max_inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Returns the tightest interval contained in both ranges.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::NoIntersection`] when the ranges do not
    /// overlap.
    pub fn common_range(&self, other: &Self) -> Result<Self, VersionError> {
        // Tighter lower bound wins; on a tie, exclusive wins.
        let (min, min_inclusive) = match self.min.cmp(&other.min) {
            Ordering::Greater => (self.min, self.min_inclusive),
            Ordering::Less => (other.min, other.min_inclusive),
            Ordering::Equal => (self.min, self.min_inclusive && other.min_inclusive),
        };

        // Tighter upper bound wins; on a tie, exclusive wins.
        let (max, max_inclusive) = match (&self.max, &other.max) {
            (None, None) => (None, false),
            (Some(m), None) => (Some(*m), self.max_inclusive),
            (None, Some(m)) => (Some(*m), other.max_inclusive),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(*a), self.max_inclusive),
                Ordering::Greater => (Some(*b), other.max_inclusive),
                Ordering::Equal => (Some(*a), self.max_inclusive && other.max_inclusive),
            },
        };

        let empty = match &max {
            None => false,
            Some(max) => match min.cmp(max) {
                Ordering::Greater => true,
                Ordering::Equal => !(min_inclusive && max_inclusive),
                Ordering::Less => false,
            },
        };
        if empty {
            return Err(VersionError::NoIntersection {
                left: self.to_string(),
                right: other.to_string(),
            });
        }

        Ok(Self {
            min,
            min_inclusive,
            max,
            max_inclusive,
        })
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.min_inclusive { '[' } else { '(' };
        let close = if self.max_inclusive { ']' } else { ')' };
        match &self.max {
            None => write!(f, "{}{},{INFINITY}{}", open, self.min, close),
            Some(max) => write!(f, "{}{},{}{}", open, self.min, max, close),
        }
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || VersionError::InvalidRange {
            input: s.to_string(),
        };

        let first = s.chars().next().ok_or_else(invalid)?;
        if first != '[' && first != '(' {
            // Shorthand: a bare version means "this version or newer".
            let min: Version = s.parse()?;
            return Ok(Self {
                min,
                min_inclusive: true,
                max: None,
                max_inclusive: false,
            });
        }

        let last = s.chars().last().ok_or_else(invalid)?;
        if last != ']' && last != ')' {
            return Err(invalid());
        }

        let inner = &s[1..s.len() - 1];
        let (lo, hi) = inner.split_once(',').ok_or_else(invalid)?;
        let min: Version = lo.trim().parse()?;
        let hi = hi.trim();
        let max = if hi.eq_ignore_ascii_case(INFINITY) {
            None
        } else {
            Some(hi.parse::<Version>()?)
        };

        let range = Self {
            min,
            min_inclusive: first == '[',
            max,
            max_inclusive: last == ']',
        };

        // Reject inverted or empty intervals up front.
        if let Some(max) = &range.max {
            let empty = match range.min.cmp(max) {
                Ordering::Greater => true,
                Ordering::Equal => !(range.min_inclusive && range.max_inclusive),
                Ordering::Less => false,
            };
            if empty {
                return Err(invalid());
            }
        }
        Ok(range)
    }
}

impl Serialize for VersionRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn r(s: &str) -> VersionRange {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(v("1.2.3"), Version::new(1, 2, 3));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v("4"), Version::new(4, 0, 0));
        assert!("".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
        assert!("1..3".parse::<Version>().is_err());
    }

    #[test]
    fn test_bare_version_is_unbounded_range() {
        let range = r("1.2.0");
        assert!(range.contains(&v("1.2.0")));
        assert!(range.contains(&v("99.0.0")));
        assert!(!range.contains(&v("1.1.9")));
        assert_eq!(range.to_string(), "[1.2.0,INFINITY)");
    }

    #[test]
    fn test_interval_bounds() {
        let range = r("[1.0.0,2.0.0)");
        assert!(range.contains(&v("1.0.0")));
        assert!(range.contains(&v("1.9.9")));
        assert!(!range.contains(&v("2.0.0")));

        let range = r("(1.0.0,2.0.0]");
        assert!(!range.contains(&v("1.0.0")));
        assert!(range.contains(&v("2.0.0")));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("[1.0.0,2.0.0".parse::<VersionRange>().is_err());
        assert!("[2.0.0,1.0.0)".parse::<VersionRange>().is_err());
        assert!("[1.0.0,1.0.0)".parse::<VersionRange>().is_err());
        assert!("[1.0.0 2.0.0)".parse::<VersionRange>().is_err());
    }

    #[test]
    fn test_common_range() {
        let a = r("[1.0.0,3.0.0)");
        let b = r("[2.0.0,INFINITY)");
        let c = a.common_range(&b).unwrap();
        assert_eq!(c.to_string(), "[2.0.0,3.0.0)");

        // Symmetric.
        let c2 = b.common_range(&a).unwrap();
        assert_eq!(c, c2);
    }

    #[test]
    fn test_common_range_disjoint() {
        let a = r("[1.0.0,2.0.0)");
        let b = r("[2.0.0,3.0.0)");
        assert!(matches!(
            a.common_range(&b),
            Err(VersionError::NoIntersection { .. })
        ));
    }

    #[test]
    fn test_common_range_touching_inclusive() {
        let a = r("[1.0.0,2.0.0]");
        let b = r("[2.0.0,3.0.0)");
        let c = a.common_range(&b).unwrap();
        assert_eq!(c.to_string(), "[2.0.0,2.0.0]");
        assert!(c.contains(&v("2.0.0")));
    }

    #[test]
    fn test_range_round_trips_through_serde() {
        let range = r("[1.2.0,4.5.6)");
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\"[1.2.0,4.5.6)\"");
        let back: VersionRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, back);
    }
}
