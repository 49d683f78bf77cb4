//! Operation descriptors.
//!
//! The compact wire form is one of:
//!
//! - `passthrough`
//! - `filter:<column>:<threshold>`
//! - `groupby:<groupColumn>:<sumColumn>`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A relational operation to stream over a source. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Identity: every row flows through unchanged.
    Passthrough,
    /// Keep rows whose numeric `column` is `>= threshold`.
    Filter { column: String, threshold: f64 },
    /// Sum numeric `sum_column` per distinct value of `group_column`.
    GroupSum {
        group_column: String,
        sum_column: String,
    },
}

impl Operation {
    /// Short label used for stats and log lines.
    pub fn method(&self) -> &'static str {
        match self {
            Operation::Passthrough => "passthrough",
            Operation::Filter { .. } => "filter",
            Operation::GroupSum { .. } => "groupby",
        }
    }

    /// Whether results depend on state carried across batches.
    pub fn is_stateful(&self) -> bool {
        matches!(self, Operation::GroupSum { .. })
    }
}

impl FromStr for Operation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| EngineError::OperatorConstruction { reason };
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["passthrough"] => Ok(Operation::Passthrough),
            ["filter", column, threshold] => {
                let column = non_empty(column, "filter column").map_err(invalid)?;
                let threshold = threshold.trim().parse::<f64>().map_err(|e| {
                    invalid(format!("filter threshold '{threshold}' is not a number: {e}"))
                })?;
                if !threshold.is_finite() {
                    return Err(invalid(format!("filter threshold {threshold} must be finite")));
                }
                Ok(Operation::Filter { column, threshold })
            }
            ["groupby", group, sum] => Ok(Operation::GroupSum {
                group_column: non_empty(group, "group column").map_err(invalid)?,
                sum_column: non_empty(sum, "sum column").map_err(invalid)?,
            }),
            ["passthrough", ..] => Err(invalid(format!("passthrough takes no arguments, got '{s}'"))),
            ["filter", ..] => Err(invalid(format!(
                "expected 'filter:<column>:<threshold>', got '{s}'"
            ))),
            ["groupby", ..] => Err(invalid(format!(
                "expected 'groupby:<groupColumn>:<sumColumn>', got '{s}'"
            ))),
            [verb, ..] => Err(invalid(format!("unknown operation '{verb}'"))),
            [] => Err(invalid("empty operation descriptor".to_string())),
        }
    }
}

fn non_empty(s: &str, what: &str) -> Result<String, String> {
    let s = s.trim();
    if s.is_empty() {
        Err(format!("{what} must not be empty"))
    } else {
        Ok(s.to_string())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Passthrough => f.write_str("passthrough"),
            Operation::Filter { column, threshold } => write!(f, "filter:{column}:{threshold}"),
            Operation::GroupSum {
                group_column,
                sum_column,
            } => write!(f, "groupby:{group_column}:{sum_column}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Operation;

    #[test]
    fn parses_every_verb() {
        assert_eq!("passthrough".parse::<Operation>().unwrap(), Operation::Passthrough);
        assert_eq!(
            "filter:salary:60000".parse::<Operation>().unwrap(),
            Operation::Filter {
                column: "salary".to_string(),
                threshold: 60000.0
            }
        );
        assert_eq!(
            "groupby:department:salary".parse::<Operation>().unwrap(),
            Operation::GroupSum {
                group_column: "department".to_string(),
                sum_column: "salary".to_string()
            }
        );
    }

    #[test]
    fn display_is_the_wire_form() {
        for s in ["passthrough", "filter:age:30.5", "groupby:department:salary"] {
            let op: Operation = s.parse().unwrap();
            assert_eq!(op.to_string(), s);
        }
    }

    #[test]
    fn rejects_unknown_verbs_and_malformed_arguments() {
        let cases = [
            ("sort:age", "unknown operation 'sort'"),
            ("filter:salary", "expected 'filter:<column>:<threshold>'"),
            ("filter:salary:lots", "is not a number"),
            ("filter::10", "filter column must not be empty"),
            ("groupby:department", "expected 'groupby:<groupColumn>:<sumColumn>'"),
            ("passthrough:extra", "passthrough takes no arguments"),
            ("filter:salary:inf", "must be finite"),
        ];
        for (input, needle) in cases {
            let err = input.parse::<Operation>().unwrap_err().to_string();
            assert!(err.contains(needle), "{input}: {err}");
            assert!(err.starts_with("configure:"), "{input}: {err}");
        }
    }
}
