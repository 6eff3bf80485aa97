use std::sync::Arc;

use arrow_array::{ArrayRef, Int64Array, RecordBatch};
use arrow_schema::{Schema, SortOptions};
use datafusion::common::{internal_err, Result};

use crate::physical_plan::window::boundary::BoundaryTracker;

use super::WindowFunctionKind;

/// ROW_NUMBER, RANK and DENSE_RANK.
///
/// All three only need the current position in the partition and in the
/// current peer group, so every input row gets its value immediately.
pub struct RankEvaluator {
    kind: WindowFunctionKind,
    peers: BoundaryTracker,
    row_number: i64,
    rank: i64,
    dense_rank: i64,
}

impl RankEvaluator {
    pub fn try_new(
        kind: WindowFunctionKind,
        schema: &Schema,
        ordering: &[(usize, SortOptions)],
    ) -> Result<Self> {
        if !kind.is_streaming() {
            return internal_err!("{kind} is not a streaming window function");
        }
        Ok(Self {
            kind,
            peers: BoundaryTracker::try_new(schema, ordering)?,
            row_number: 0,
            rank: 0,
            dense_rank: 0,
        })
    }

    pub fn kind(&self) -> WindowFunctionKind {
        self.kind
    }

    /// Back to the state before the first row of a partition.
    pub fn reset(&mut self) {
        self.row_number = 0;
        self.rank = 0;
        self.dense_rank = 0;
        self.peers.reset();
    }

    pub fn evaluate(&mut self, batch: &RecordBatch, partition_starts: &[usize]) -> Result<ArrayRef> {
        let peer_starts = self.peers.boundaries(batch)?;
        let mut next_partition = partition_starts.iter().copied().peekable();
        let mut next_peer_group = peer_starts.iter().copied().peekable();

        let mut values = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            if next_partition.next_if_eq(&row).is_some() {
                self.row_number = 0;
                self.rank = 0;
                self.dense_rank = 0;
            }
            let new_peer_group = next_peer_group.next_if_eq(&row).is_some();

            self.row_number += 1;
            // the first row of a partition always opens a peer group
            if self.row_number == 1 || new_peer_group {
                self.rank = self.row_number;
                self.dense_rank += 1;
            }
            values.push(match self.kind {
                WindowFunctionKind::RowNumber => self.row_number,
                WindowFunctionKind::Rank => self.rank,
                _ => self.dense_rank,
            });
        }
        Ok(Arc::new(Int64Array::from(values)))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::AsArray;
    use arrow::datatypes::Int64Type;
    use arrow_schema::{DataType, Field};

    use super::*;

    fn batch(values: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn run(kind: WindowFunctionKind, batches: &[(Vec<Option<i64>>, Vec<usize>)]) -> Vec<i64> {
        let schema = batch(vec![]).schema();
        let mut evaluator =
            RankEvaluator::try_new(kind, &schema, &[(0, SortOptions::default())]).unwrap();
        batches
            .iter()
            .flat_map(|(values, starts)| {
                let out = evaluator.evaluate(&batch(values.clone()), starts).unwrap();
                out.as_primitive::<Int64Type>().values().to_vec()
            })
            .collect()
    }

    #[test]
    fn peer_groups_span_batches() {
        let input = [
            (vec![None, None, Some(1)], vec![]),
            (vec![Some(1), Some(2)], vec![]),
            (vec![Some(3), Some(3)], vec![]),
        ];
        assert_eq!(run(WindowFunctionKind::RowNumber, &input), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(run(WindowFunctionKind::Rank, &input), vec![1, 1, 3, 3, 5, 6, 6]);
        assert_eq!(run(WindowFunctionKind::DenseRank, &input), vec![1, 1, 2, 2, 3, 4, 4]);
    }

    #[test]
    fn partitions_reset_all_counters() {
        // partition starts at offsets 2 of the first batch and 0 of the second
        let input = [
            (vec![Some(1), Some(2), Some(2), Some(5)], vec![2]),
            (vec![Some(5), Some(6)], vec![0]),
        ];
        assert_eq!(run(WindowFunctionKind::RowNumber, &input), vec![1, 2, 1, 2, 1, 2]);
        assert_eq!(run(WindowFunctionKind::Rank, &input), vec![1, 2, 1, 1, 1, 2]);
        assert_eq!(run(WindowFunctionKind::DenseRank, &input), vec![1, 2, 1, 1, 1, 2]);
    }

    #[test]
    fn without_ordering_every_row_is_a_peer() {
        let schema = batch(vec![]).schema();
        let mut evaluator = RankEvaluator::try_new(WindowFunctionKind::Rank, &schema, &[]).unwrap();
        let out = evaluator
            .evaluate(&batch(vec![Some(3), Some(1), Some(2)]), &[])
            .unwrap();
        assert_eq!(out.as_primitive::<Int64Type>().values().to_vec(), vec![1, 1, 1]);
    }

    #[test]
    fn rejects_materializing_kinds() {
        let schema = batch(vec![]).schema();
        assert!(RankEvaluator::try_new(WindowFunctionKind::CumeDist, &schema, &[]).is_err());
    }
}
