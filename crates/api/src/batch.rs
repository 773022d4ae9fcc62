use tally_core::{DataError, DataResult};

use crate::MutationOutcome;

/// Aggregated outcome of a batch. Items keep their input index; both lists are in
/// input order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(usize, MutationOutcome<T>)>,
    pub failed: Vec<(usize, DataError)>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self { Self { succeeded: Vec::new(), failed: Vec::new() } }
}

impl<T> BatchReport<T> {
    pub(crate) fn from_results(results: Vec<(usize, DataResult<MutationOutcome<T>>)>) -> Self {
        let mut report = Self::default();
        for (i, res) in results {
            match res {
                Ok(o) => report.succeeded.push((i, o)),
                Err(e) => report.failed.push((i, e)),
            }
        }
        report
    }

    pub fn len(&self) -> usize { self.succeeded.len() + self.failed.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// True when no item failed.
    pub fn is_complete(&self) -> bool { self.failed.is_empty() }

    /// First failure, for callers that treat the batch as all-or-nothing.
    pub fn first_error(&self) -> Option<&DataError> { self.failed.first().map(|(_, e)| e) }

    pub fn into_result(self) -> DataResult<Vec<MutationOutcome<T>>> {
        match self.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(self.succeeded.into_iter().map(|(_, o)| o).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn results_split_by_outcome_in_index_order() {
        let report: BatchReport<serde_json::Value> = BatchReport::from_results(vec![
            (0, Ok(MutationOutcome::Deleted { id: json!(1) })),
            (1, Err(DataError::not_found("items", "9"))),
            (2, Ok(MutationOutcome::Deleted { id: json!(2) })),
        ]);
        assert_eq!(report.len(), 3);
        assert!(!report.is_complete());
        assert_eq!(report.succeeded.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(report.failed[0].0, 1);
        assert_eq!(report.first_error().map(|e| e.kind()), Some("not_found"));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn empty_batch_is_complete() {
        let report: BatchReport<serde_json::Value> = BatchReport::default();
        assert!(report.is_empty());
        assert!(report.is_complete());
        assert_eq!(report.into_result().unwrap(), vec![]);
    }
}
