//! Closed typed constants carried inside a query
//!
//! Each constant has an integer index and a canonical lowercase string form;
//! the string form is also the serde representation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Stdev,
    Stdevp,
    Var,
    Varp,
}

impl AggregateFunction {
    pub fn index(&self) -> usize {
        match self {
            AggregateFunction::Count => 0,
            AggregateFunction::Sum => 1,
            AggregateFunction::Avg => 2,
            AggregateFunction::Stdev => 3,
            AggregateFunction::Stdevp => 4,
            AggregateFunction::Var => 5,
            AggregateFunction::Varp => 6,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Stdev => "stdev",
            AggregateFunction::Stdevp => "stdevp",
            AggregateFunction::Var => "var",
            AggregateFunction::Varp => "varp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "stdev" => Some(AggregateFunction::Stdev),
            "stdevp" => Some(AggregateFunction::Stdevp),
            "var" => Some(AggregateFunction::Var),
            "varp" => Some(AggregateFunction::Varp),
            _ => None,
        }
    }

    pub fn all() -> [AggregateFunction; 7] {
        [
            AggregateFunction::Count,
            AggregateFunction::Sum,
            AggregateFunction::Avg,
            AggregateFunction::Stdev,
            AggregateFunction::Stdevp,
            AggregateFunction::Var,
            AggregateFunction::Varp,
        ]
    }
}

impl std::fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
}

impl ColumnType {
    pub fn index(&self) -> usize {
        0
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Some(ColumnType::String),
            _ => None,
        }
    }

    pub fn all() -> [ColumnType; 1] {
        [ColumnType::String]
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Not,
    And,
    Or,
}

impl ConditionOperator {
    pub fn index(&self) -> usize {
        match self {
            ConditionOperator::Not => 0,
            ConditionOperator::And => 1,
            ConditionOperator::Or => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Not => "not",
            ConditionOperator::And => "and",
            ConditionOperator::Or => "or",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "not" => Some(ConditionOperator::Not),
            "and" => Some(ConditionOperator::And),
            "or" => Some(ConditionOperator::Or),
            _ => None,
        }
    }

    pub fn all() -> [ConditionOperator; 3] {
        [
            ConditionOperator::Not,
            ConditionOperator::And,
            ConditionOperator::Or,
        ]
    }

    /// `not` is unary, `and`/`or` are binary.
    pub fn arity(&self) -> usize {
        match self {
            ConditionOperator::Not => 1,
            ConditionOperator::And | ConditionOperator::Or => 2,
        }
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
