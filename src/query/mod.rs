//! Validated aggregate query model
//!
//! The query arrives already parsed. Parties receive it as JSON text
//! (`Query::to_wire`) and rebuild the same domain from its group-by columns.

pub mod constants;

pub use constants::{AggregateFunction, ColumnType, ConditionOperator};

use crate::error::{QueryError, Result};
use crate::party::Party;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub table: String,
    pub name: String,
    /// DB party holding this column.
    pub db: Party,
    pub column_type: ColumnType,
    /// Declared value set for grouping; `None` entries stand for SQL NULL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<Option<String>>>,
}

impl Column {
    pub fn label(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub column: Column,
}

impl Aggregate {
    pub fn label(&self) -> String {
        format!("{}({})", self.function, self.column.label())
    }
}

/// Filter tree passed through to the DB parties without interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        column: String,
        comparison: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    Node {
        operator: ConditionOperator,
        operands: Vec<Condition>,
    },
}

impl Condition {
    fn check_arity(&self) -> Result<()> {
        match self {
            Condition::Comparison { .. } => Ok(()),
            Condition::Node { operator, operands } => {
                if operands.len() != operator.arity() {
                    return Err(QueryError::InvalidQuery(format!(
                        "operator '{}' takes {} operand(s), got {}",
                        operator,
                        operator.arity(),
                        operands.len()
                    )));
                }
                operands.iter().try_for_each(Condition::check_arity)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    pub aggregates: Vec<Aggregate>,
    /// Per-DB filter applied before aggregation.
    #[serde(default)]
    pub prefilters: BTreeMap<Party, Condition>,
    /// Grouping dimensions, in domain order.
    #[serde(default)]
    pub group_bys: Vec<Column>,
}

impl Query {
    pub fn validate(&self) -> Result<()> {
        if self.aggregates.is_empty() {
            return Err(QueryError::InvalidQuery(
                "query must contain at least one aggregate".to_string(),
            ));
        }

        for aggregate in &self.aggregates {
            if !aggregate.column.db.is_db() {
                return Err(QueryError::InvalidQuery(format!(
                    "aggregate column {} is not held by a db party",
                    aggregate.column.label()
                )));
            }
        }

        for (party, condition) in &self.prefilters {
            if !party.is_db() {
                return Err(QueryError::InvalidQuery(format!(
                    "prefilter attached to non-db party {}",
                    party
                )));
            }
            condition.check_arity()?;
        }

        for column in &self.group_bys {
            if !column.db.is_db() {
                return Err(QueryError::InvalidQuery(format!(
                    "group-by column {} is not held by a db party",
                    column.label()
                )));
            }
            if column.domain.is_none() {
                return Err(QueryError::InvalidQuery(format!(
                    "group-by column {} has no declared domain",
                    column.label()
                )));
            }
        }

        Ok(())
    }

    pub fn aggregate_labels(&self) -> Vec<String> {
        self.aggregates.iter().map(Aggregate::label).collect()
    }

    /// Serialized query text sent in "start query" events.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_valid_query_round_trips_through_wire_text() {
        let mut query = query_with_dimensions(&[3, 4]);
        query.prefilters.insert(
            Party::Db1,
            Condition::Node {
                operator: ConditionOperator::Not,
                operands: vec![Condition::Comparison {
                    column: "visits.g0".to_string(),
                    comparison: "is_null".to_string(),
                    value: None,
                }],
            },
        );

        query.validate().unwrap();
        let text = query.to_wire().unwrap();
        assert!(text.contains("\"db1\""));
        assert_eq!(Query::from_wire(&text).unwrap(), query);
    }

    #[test]
    fn test_rejects_empty_aggregates() {
        let mut query = query_with_dimensions(&[2]);
        query.aggregates.clear();
        assert!(matches!(query.validate(), Err(QueryError::InvalidQuery(_))));
    }

    #[test]
    fn test_rejects_group_by_without_domain() {
        let mut query = query_with_dimensions(&[]);
        query.group_bys.push(column(Party::Db2, "region", None));
        let err = query.validate().unwrap_err();
        assert!(err.to_string().contains("visits.region"));
    }

    #[test]
    fn test_rejects_bad_operator_arity_and_hub_prefilter() {
        let mut query = query_with_dimensions(&[]);
        query.prefilters.insert(
            Party::Db2,
            Condition::Node {
                operator: ConditionOperator::And,
                operands: vec![],
            },
        );
        assert!(query.validate().is_err());

        let mut query = query_with_dimensions(&[]);
        query.prefilters.insert(
            Party::Ph,
            Condition::Comparison {
                column: "visits.id".to_string(),
                comparison: "eq".to_string(),
                value: Some("1".to_string()),
            },
        );
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_aggregate_labels() {
        let query = query_with_dimensions(&[]);
        assert_eq!(
            query.aggregate_labels(),
            vec!["count(visits.id)".to_string(), "sum(visits.cost)".to_string()]
        );
    }
}
