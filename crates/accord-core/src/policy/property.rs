//! Advertised properties and counter-party constraint expressions.
//!
//! A party advertises a flat list of named properties. The counter party may
//! carry a boolean constraint tree (AND/OR/NOT over `{name, op, value}`
//! requirements) that must be satisfiable by those advertised properties for
//! a match to succeed.
//!
//! Comparison semantics by advertised type:
//!
//! - `string`: `in` is set membership in a comma-separated set
//! - `int`/`float`: `=`, `>=`, `<=`, and `in` over an inclusive `lo-hi`
//!   range; floats coerce to int by truncation
//! - `boolean`: `=`
//! - `list`: `in` is non-empty intersection of comma-separated sets
//! - `version`: `in` is containment in a version range expression

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::{Version, VersionRange};

/// Errors raised while evaluating a constraint expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PropertyError {
    /// An operator is not defined for the advertised value's type.
    #[error("operator '{op}' is not defined for property '{name}'")]
    BadOperator {
        /// Requirement property name.
        name: String,
        /// The unsupported operator.
        op: String,
    },

    /// A requirement value could not be parsed for the comparison.
    #[error("requirement value '{value}' for property '{name}' is malformed")]
    BadRequirementValue {
        /// Requirement property name.
        name: String,
        /// The malformed value.
        value: String,
    },
}

/// A single advertised property value.
///
/// The wire form is plain JSON scalars; lists and versions travel as
/// strings and are interpreted by the declared `propType` (or inferred).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String, comma-separated list, or version expression.
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// An advertised property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Property name, unique within the list.
    pub name: String,
    /// Advertised value.
    pub value: PropertyValue,
    /// Declared type: `string`, `int`, `float`, `boolean`, `list`,
    /// `version`. Inferred from the value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop_type: Option<String>,
}

impl Property {
    /// Creates a property with an inferred type.
    #[must_use]
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
            prop_type: None,
        }
    }

    /// Creates a property with an explicit declared type.
    #[must_use]
    pub fn typed(name: impl Into<String>, value: PropertyValue, prop_type: &str) -> Self {
        Self {
            name: name.into(),
            value,
            prop_type: Some(prop_type.to_string()),
        }
    }

    fn effective_type(&self) -> &str {
        if let Some(t) = &self.prop_type {
            return t;
        }
        match &self.value {
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Text(_) => "string",
        }
    }
}

/// A list of advertised properties.
pub type PropertyList = Vec<Property>;

/// Merges two advertised property lists, first list winning on name clashes.
#[must_use]
pub fn merge_properties(a: &PropertyList, b: &PropertyList) -> PropertyList {
    let mut merged = a.clone();
    for prop in b {
        if !merged.iter().any(|p| p.name == prop.name) {
            merged.push(prop.clone());
        }
    }
    merged
}

/// Comparison operator in a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equality.
    #[serde(rename = "=")]
    Eq,
    /// Greater than or equal (numeric only).
    #[serde(rename = ">=")]
    Gte,
    /// Less than or equal (numeric only).
    #[serde(rename = "<=")]
    Lte,
    /// Membership / containment; meaning depends on the advertised type.
    #[serde(rename = "in")]
    In,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::In => "in",
        };
        f.write_str(s)
    }
}

/// A boolean constraint tree over counter-party properties.
///
/// The wire form discriminates by field shape: `{"name","op","value"}` is a
/// leaf requirement, `{"and":[...]}`, `{"or":[...]}` and `{"not":{...}}`
/// are the connectives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraint {
    /// Leaf requirement against a single named property.
    Require {
        /// Property name to test.
        name: String,
        /// Comparison operator.
        op: CompareOp,
        /// Requirement value, textual.
        value: String,
    },
    /// All sub-constraints must hold.
    All {
        /// Conjuncts.
        and: Vec<Constraint>,
    },
    /// At least one sub-constraint must hold.
    Any {
        /// Disjuncts.
        or: Vec<Constraint>,
    },
    /// The sub-constraint must not hold.
    Negate {
        /// Negated constraint.
        not: Box<Constraint>,
    },
}

impl Constraint {
    /// Evaluates the constraint against an advertised property list.
    ///
    /// A requirement on a property that is not advertised is unsatisfied
    /// (not an error); malformed requirement values and type-invalid
    /// operators are errors.
    ///
    /// # Errors
    ///
    /// Returns [`PropertyError`] when a requirement cannot be evaluated.
    pub fn satisfied_by(&self, props: &PropertyList) -> Result<bool, PropertyError> {
        match self {
            Self::Require { name, op, value } => {
                let Some(prop) = props.iter().find(|p| p.name == *name) else {
                    return Ok(false);
                };
                satisfies(prop, *op, value)
            }
            Self::All { and } => {
                for c in and {
                    if !c.satisfied_by(props)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any { or } => {
                for c in or {
                    if c.satisfied_by(props)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Negate { not } => Ok(!not.satisfied_by(props)?),
        }
    }

    /// Names of all properties the expression references.
    #[must_use]
    pub fn referenced_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Self::Require { name, .. } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Self::All { and } => and.iter().for_each(|c| c.collect_names(out)),
            Self::Any { or } => or.iter().for_each(|c| c.collect_names(out)),
            Self::Negate { not } => not.collect_names(out),
        }
    }
}

fn satisfies(prop: &Property, op: CompareOp, req: &str) -> Result<bool, PropertyError> {
    let bad_op = || PropertyError::BadOperator {
        name: prop.name.clone(),
        op: op.to_string(),
    };
    let bad_value = || PropertyError::BadRequirementValue {
        name: prop.name.clone(),
        value: req.to_string(),
    };

    match prop.effective_type() {
        "boolean" => {
            let advertised = match &prop.value {
                PropertyValue::Bool(b) => *b,
                PropertyValue::Text(s) => s.parse::<bool>().map_err(|_| bad_value())?,
                _ => return Ok(false),
            };
            match op {
                CompareOp::Eq => {
                    let want = req.parse::<bool>().map_err(|_| bad_value())?;
                    Ok(advertised == want)
                }
                _ => Err(bad_op()),
            }
        }
        "int" | "float" => {
            // Floats coerce to int by truncation for all numeric compares.
            let advertised = match &prop.value {
                PropertyValue::Int(i) => *i,
                #[allow(clippy::cast_possible_truncation)]
                PropertyValue::Float(x) => x.trunc() as i64,
                PropertyValue::Text(s) => s.trim().parse::<i64>().map_err(|_| bad_value())?,
                PropertyValue::Bool(_) => return Ok(false),
            };
            match op {
                CompareOp::Eq => Ok(advertised == parse_int(req).ok_or_else(bad_value)?),
                CompareOp::Gte => Ok(advertised >= parse_int(req).ok_or_else(bad_value)?),
                CompareOp::Lte => Ok(advertised <= parse_int(req).ok_or_else(bad_value)?),
                CompareOp::In => {
                    let (lo, hi) = req.split_once('-').ok_or_else(bad_value)?;
                    let lo = parse_int(lo).ok_or_else(bad_value)?;
                    let hi = parse_int(hi).ok_or_else(bad_value)?;
                    Ok(advertised >= lo && advertised <= hi)
                }
            }
        }
        "list" => {
            let advertised = match &prop.value {
                PropertyValue::Text(s) => s,
                _ => return Ok(false),
            };
            match op {
                CompareOp::In => {
                    let have: Vec<&str> = advertised.split(',').map(str::trim).collect();
                    Ok(req.split(',').map(str::trim).any(|w| have.contains(&w)))
                }
                _ => Err(bad_op()),
            }
        }
        "version" => {
            let advertised = match &prop.value {
                PropertyValue::Text(s) => s.parse::<Version>().map_err(|_| bad_value())?,
                _ => return Ok(false),
            };
            match op {
                CompareOp::In => {
                    let range = req.parse::<VersionRange>().map_err(|_| bad_value())?;
                    Ok(range.contains(&advertised))
                }
                CompareOp::Eq => {
                    let want = req.parse::<Version>().map_err(|_| bad_value())?;
                    Ok(advertised == want)
                }
                _ => Err(bad_op()),
            }
        }
        // Everything else compares as a string.
        _ => {
            let advertised = prop.value.to_string();
            match op {
                CompareOp::Eq => Ok(advertised == req),
                CompareOp::In => Ok(req.split(',').map(str::trim).any(|w| w == advertised)),
                _ => Err(bad_op()),
            }
        }
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    // Truncating float coercion.
    let x = s.parse::<f64>().ok()?;
    #[allow(clippy::cast_possible_truncation)]
    let truncated = x.trunc() as i64;
    Some(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> PropertyList {
        vec![
            Property::new("arch", PropertyValue::Text("amd64".into())),
            Property::new("ram", PropertyValue::Int(2048)),
            Property::new("cpus", PropertyValue::Float(4.7)),
            Property::new("gpu", PropertyValue::Bool(false)),
            Property::typed(
                "zones",
                PropertyValue::Text("us-east, us-west".into()),
                "list",
            ),
            Property::typed("agent", PropertyValue::Text("2.3.1".into()), "version"),
        ]
    }

    fn req(name: &str, op: CompareOp, value: &str) -> Constraint {
        Constraint::Require {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    #[test]
    fn test_string_membership() {
        let c = req("arch", CompareOp::In, "amd64,arm64");
        assert!(c.satisfied_by(&props()).unwrap());
        let c = req("arch", CompareOp::In, "arm64");
        assert!(!c.satisfied_by(&props()).unwrap());
    }

    #[test]
    fn test_numeric_compares() {
        assert!(req("ram", CompareOp::Gte, "1024")
            .satisfied_by(&props())
            .unwrap());
        assert!(!req("ram", CompareOp::Gte, "4096")
            .satisfied_by(&props())
            .unwrap());
        assert!(req("ram", CompareOp::In, "1024-4096")
            .satisfied_by(&props())
            .unwrap());
        // Float advertised value truncates: 4.7 -> 4.
        assert!(req("cpus", CompareOp::Eq, "4").satisfied_by(&props()).unwrap());
        assert!(req("cpus", CompareOp::Lte, "4")
            .satisfied_by(&props())
            .unwrap());
    }

    #[test]
    fn test_boolean_and_bad_operator() {
        assert!(req("gpu", CompareOp::Eq, "false")
            .satisfied_by(&props())
            .unwrap());
        assert!(matches!(
            req("gpu", CompareOp::Gte, "true").satisfied_by(&props()),
            Err(PropertyError::BadOperator { .. })
        ));
    }

    #[test]
    fn test_list_intersection() {
        assert!(req("zones", CompareOp::In, "eu-central,us-west")
            .satisfied_by(&props())
            .unwrap());
        assert!(!req("zones", CompareOp::In, "eu-central")
            .satisfied_by(&props())
            .unwrap());
    }

    #[test]
    fn test_version_containment() {
        assert!(req("agent", CompareOp::In, "[2.0.0,3.0.0)")
            .satisfied_by(&props())
            .unwrap());
        assert!(!req("agent", CompareOp::In, "[3.0.0,INFINITY)")
            .satisfied_by(&props())
            .unwrap());
    }

    #[test]
    fn test_missing_property_is_unsatisfied() {
        let c = req("nope", CompareOp::Eq, "x");
        assert!(!c.satisfied_by(&props()).unwrap());
    }

    #[test]
    fn test_tree_evaluation() {
        let c = Constraint::All {
            and: vec![
                req("arch", CompareOp::Eq, "amd64"),
                Constraint::Any {
                    or: vec![
                        req("ram", CompareOp::Gte, "4096"),
                        req("gpu", CompareOp::Eq, "false"),
                    ],
                },
                Constraint::Negate {
                    not: Box::new(req("arch", CompareOp::Eq, "arm64")),
                },
            ],
        };
        assert!(c.satisfied_by(&props()).unwrap());
    }

    #[test]
    fn test_constraint_wire_form() {
        let json = r#"{"and":[{"name":"ram","op":">=","value":"4096"},{"not":{"name":"gpu","op":"=","value":"true"}}]}"#;
        let c: Constraint = serde_json::from_str(json).unwrap();
        assert_eq!(c.referenced_names(), vec!["ram".to_string(), "gpu".to_string()]);
        let back = serde_json::to_string(&c).unwrap();
        let c2: Constraint = serde_json::from_str(&back).unwrap();
        assert_eq!(c, c2);
    }
}
