//! Deterministic enumeration of a query's grouping domain
//!
//! Tuples are ordered like an odometer over the group-by columns: the last
//! column varies fastest. Index `i` therefore names the same combination for
//! every party that holds the same `Query`.

use crate::error::{QueryError, Result};
use crate::party::Party;
use crate::query::Query;
use std::sync::Arc;

/// Largest tuple count any party can address.
pub const MAX_TUPLE_COUNT: usize = i32::MAX as usize;

/// One grouping value; `None` is SQL NULL.
pub type DomainValue = Option<String>;

#[derive(Debug, Clone)]
pub struct DomainIterator {
    query: Arc<Query>,
    radices: Vec<usize>,
    count: usize,
}

impl DomainIterator {
    pub fn new(query: Arc<Query>) -> Result<Self> {
        let mut radices = Vec::with_capacity(query.group_bys.len());
        let mut count: usize = 1;

        for column in &query.group_bys {
            let size = match &column.domain {
                Some(values) => values.len(),
                None => {
                    return Err(QueryError::InvalidQuery(format!(
                        "group-by column {} has no declared domain",
                        column.label()
                    )))
                }
            };

            if size == 0 {
                return Err(QueryError::InvalidQuery(format!(
                    "group-by column {} declares no values",
                    column.label()
                )));
            }

            count = count
                .checked_mul(size)
                .filter(|&c| c <= MAX_TUPLE_COUNT)
                .ok_or(QueryError::DomainOverflow {
                    dimensions: query.group_bys.len(),
                    limit: MAX_TUPLE_COUNT,
                })?;
            radices.push(size);
        }

        Ok(Self {
            query,
            radices,
            count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dimensions(&self) -> usize {
        self.radices.len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.query.group_bys.iter().map(|c| c.label()).collect()
    }

    /// Per-dimension value positions for tuple `index`.
    pub fn positions(&self, index: usize) -> Option<Vec<usize>> {
        if index >= self.count {
            return None;
        }

        let mut positions = vec![0; self.radices.len()];
        let mut rest = index;
        for (d, &radix) in self.radices.iter().enumerate().rev() {
            positions[d] = rest % radix;
            rest /= radix;
        }
        Some(positions)
    }

    pub fn tuple(&self, index: usize) -> Option<Vec<DomainValue>> {
        let positions = self.positions(index)?;
        Some(
            self.query
                .group_bys
                .iter()
                .zip(positions)
                .map(|(column, p)| {
                    column
                        .domain
                        .as_ref()
                        .and_then(|values| values.get(p).cloned())
                        .flatten()
                })
                .collect(),
        )
    }

    /// Values of tuple `index` for the dimensions `party` holds, in column order.
    pub fn local_values(&self, index: usize, party: Party) -> Option<Vec<DomainValue>> {
        let tuple = self.tuple(index)?;
        Some(
            self.query
                .group_bys
                .iter()
                .zip(tuple)
                .filter(|(column, _)| column.db == party)
                .map(|(_, value)| value)
                .collect(),
        )
    }

    /// Restartable walk over every tuple in index order.
    pub fn iter(&self) -> DomainTuples<'_> {
        DomainTuples {
            domain: self,
            positions: vec![0; self.radices.len()],
            next: 0,
        }
    }
}

pub struct DomainTuples<'a> {
    domain: &'a DomainIterator,
    positions: Vec<usize>,
    next: usize,
}

impl<'a> Iterator for DomainTuples<'a> {
    type Item = (usize, Vec<DomainValue>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.domain.count {
            return None;
        }

        let tuple = self
            .domain
            .query
            .group_bys
            .iter()
            .zip(&self.positions)
            .map(|(column, &p)| {
                column
                    .domain
                    .as_ref()
                    .and_then(|values| values.get(p).cloned())
                    .flatten()
            })
            .collect();
        let index = self.next;

        // Advance the odometer.
        for d in (0..self.positions.len()).rev() {
            self.positions[d] += 1;
            if self.positions[d] < self.domain.radices[d] {
                break;
            }
            self.positions[d] = 0;
        }
        self.next += 1;

        Some((index, tuple))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.domain.count - self.next;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fixtures::{column, query_with_dimensions};

    fn domain(sizes: &[usize]) -> Result<DomainIterator> {
        DomainIterator::new(Arc::new(query_with_dimensions(sizes)))
    }

    #[test]
    fn test_count_is_product_of_cardinalities() {
        assert_eq!(domain(&[3, 4]).unwrap().count(), 12);
        assert_eq!(domain(&[2, 5, 7]).unwrap().count(), 70);
    }

    #[test]
    fn test_zero_dimensions_yield_one_tuple() {
        let domain = domain(&[]).unwrap();
        assert_eq!(domain.count(), 1);
        assert_eq!(domain.tuple(0), Some(vec![]));
        assert_eq!(domain.iter().count(), 1);
    }

    #[test]
    fn test_empty_dimension_is_invalid() {
        assert!(matches!(domain(&[3, 0]), Err(QueryError::InvalidQuery(_))));
    }

    #[test]
    fn test_overflow_is_detected() {
        // 50_000^2 = 2.5e9 > i32::MAX
        let err = domain(&[50_000, 50_000]).unwrap_err();
        assert!(matches!(err, QueryError::DomainOverflow { dimensions: 2, .. }));
    }

    #[test]
    fn test_last_dimension_varies_fastest() {
        let domain = domain(&[2, 3]).unwrap();
        let v = |s: &str| Some(s.to_string());

        assert_eq!(domain.tuple(0), Some(vec![v("v0"), v("v0")]));
        assert_eq!(domain.tuple(1), Some(vec![v("v0"), v("v1")]));
        assert_eq!(domain.tuple(3), Some(vec![v("v1"), v("v0")]));
        assert_eq!(domain.tuple(5), Some(vec![v("v1"), v("v2")]));
        assert_eq!(domain.tuple(6), None);
    }

    #[test]
    fn test_iteration_is_restartable_and_matches_random_access() {
        let domain = domain(&[3, 2, 4]).unwrap();

        let first: Vec<_> = domain.iter().collect();
        let second: Vec<_> = domain.iter().collect();
        assert_eq!(first.len(), 24);
        assert_eq!(first, second);

        for (index, tuple) in first {
            assert_eq!(domain.tuple(index), Some(tuple));
        }
    }

    #[test]
    fn test_independent_instances_agree() {
        let a = domain(&[4, 5]).unwrap();
        let b = domain(&[4, 5]).unwrap();
        for i in 0..a.count() {
            assert_eq!(a.tuple(i), b.tuple(i));
        }
    }

    #[test]
    fn test_local_values_and_null_members() {
        let mut query = query_with_dimensions(&[2]);
        let mut region = column(Party::Db2, "region", Some(&["north"][..]));
        region.domain.as_mut().unwrap().push(None);
        query.group_bys.push(region);

        let domain = DomainIterator::new(Arc::new(query)).unwrap();
        assert_eq!(domain.count(), 4);

        // dims: g0 (db1) x region (db2)
        assert_eq!(domain.local_values(1, Party::Db1), Some(vec![Some("v0".to_string())]));
        assert_eq!(domain.local_values(1, Party::Db2), Some(vec![None]));
        assert_eq!(domain.local_values(2, Party::Ph), Some(vec![]));
        assert_eq!(domain.column_names(), vec!["visits.g0", "visits.region"]);
    }
}
