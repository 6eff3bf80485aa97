use std::sync::Arc;

use arrow::array::AsArray;
use arrow::datatypes::Int64Type;
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, SortOptions};
use datafusion::common::{internal_err, Result};
use tracing::trace;

use crate::physical_plan::window::boundary::BoundaryTracker;
use crate::physical_plan::window::buffer::{BufferReplay, PartitionBuffer};

use super::WindowFunctionKind;

/// PERCENT_RANK and CUME_DIST.
///
/// Both depend on the partition size and CUME_DIST also on the size of the
/// current peer group, so the partition is read twice. The first pass
/// records the size of every peer group into a spillable buffer; the second
/// walks those sizes alongside the replayed rows.
pub struct RelativeRankEvaluator {
    kind: WindowFunctionKind,
    peers: BoundaryTracker,
    peer_sizes: PartitionBuffer,
    pending_sizes: Vec<i64>,
    peer_group_batch_size: usize,
    partition_size: usize,
    cursor: Option<PeerGroupCursor>,
}

impl RelativeRankEvaluator {
    pub fn peer_group_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(
            "peer_group_size",
            DataType::Int64,
            false,
        )]))
    }

    pub fn try_new(
        kind: WindowFunctionKind,
        schema: &Schema,
        ordering: &[(usize, SortOptions)],
        peer_sizes: PartitionBuffer,
        peer_group_batch_size: usize,
    ) -> Result<Self> {
        if kind.is_streaming() {
            return internal_err!("{kind} does not need a materialized partition");
        }
        Ok(Self {
            kind,
            peers: BoundaryTracker::try_new(schema, ordering)?,
            peer_sizes,
            pending_sizes: vec![],
            peer_group_batch_size: peer_group_batch_size.max(1),
            partition_size: 0,
            cursor: None,
        })
    }

    pub fn kind(&self) -> WindowFunctionKind {
        self.kind
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// First pass over a sealed partition.
    pub fn compute_peer_groups(&mut self, rows: BufferReplay) -> Result<()> {
        self.finish_partition();

        let mut current_group = 0usize;
        for batch in rows {
            let batch = batch?;
            let num_rows = batch.num_rows();
            self.partition_size += num_rows;

            let mut group_start = 0;
            for start in self.peers.boundaries(&batch)? {
                current_group += start - group_start;
                if current_group > 0 {
                    self.push_peer_group(current_group)?;
                }
                current_group = 0;
                group_start = start;
            }
            current_group += num_rows - group_start;
        }
        if current_group > 0 {
            self.push_peer_group(current_group)?;
        }
        self.flush_peer_groups()?;
        self.peer_sizes.seal()?;

        trace!(
            "{} partition of {} rows, peer groups spilled: {}",
            self.kind,
            self.partition_size,
            self.peer_sizes.is_spilled()
        );
        self.cursor = Some(PeerGroupCursor::new(self.peer_sizes.replay()?));
        Ok(())
    }

    fn push_peer_group(&mut self, size: usize) -> Result<()> {
        self.pending_sizes.push(size as i64);
        if self.pending_sizes.len() >= self.peer_group_batch_size {
            self.flush_peer_groups()?;
        }
        Ok(())
    }

    fn flush_peer_groups(&mut self) -> Result<()> {
        if self.pending_sizes.is_empty() {
            return Ok(());
        }
        let sizes = Int64Array::from(std::mem::take(&mut self.pending_sizes));
        let batch = RecordBatch::try_new(self.peer_sizes.schema().clone(), vec![Arc::new(sizes)])?;
        self.peer_sizes.append(batch)
    }

    /// Second pass: values for the next rows of the partition, in order.
    pub fn evaluate(&mut self, batch: &RecordBatch) -> Result<ArrayRef> {
        let Some(cursor) = self.cursor.as_mut() else {
            return internal_err!("{} evaluated before its first pass", self.kind);
        };
        let n = self.partition_size as f64;

        let mut values = Vec::with_capacity(batch.num_rows());
        for _ in 0..batch.num_rows() {
            let (rank, cume) = cursor.next_row()?;
            values.push(match self.kind {
                WindowFunctionKind::PercentRank if self.partition_size <= 1 => 0.0,
                WindowFunctionKind::PercentRank => (rank - 1) as f64 / (n - 1.0),
                _ => cume as f64 / n,
            });
        }
        Ok(Arc::new(Float64Array::from(values)))
    }

    /// Drops the per-partition state, including any spilled peer groups.
    pub fn finish_partition(&mut self) {
        self.cursor = None;
        self.pending_sizes.clear();
        self.peer_sizes.release();
        self.peers.reset();
        self.partition_size = 0;
    }
}

/// Walks the recorded peer group sizes one row at a time.
struct PeerGroupCursor {
    sizes: BufferReplay,
    current: Option<Int64Array>,
    offset: usize,
    group_size: usize,
    remaining: usize,
    rows_before: usize,
}

impl PeerGroupCursor {
    fn new(sizes: BufferReplay) -> Self {
        Self {
            sizes,
            current: None,
            offset: 0,
            group_size: 0,
            remaining: 0,
            rows_before: 0,
        }
    }

    /// Returns `(rank, rows up to and including the current peer group)`.
    fn next_row(&mut self) -> Result<(usize, usize)> {
        if self.remaining == 0 {
            self.rows_before += self.group_size;
            self.group_size = self.next_group_size()?;
            self.remaining = self.group_size;
        }
        self.remaining -= 1;
        Ok((self.rows_before + 1, self.rows_before + self.group_size))
    }

    fn next_group_size(&mut self) -> Result<usize> {
        loop {
            if let Some(sizes) = &self.current {
                if self.offset < sizes.len() {
                    let size = sizes.value(self.offset) as usize;
                    self.offset += 1;
                    if size == 0 {
                        return internal_err!("recorded an empty peer group");
                    }
                    return Ok(size);
                }
            }
            match self.sizes.next() {
                Some(batch) => {
                    self.current = Some(batch?.column(0).as_primitive::<Int64Type>().clone());
                    self.offset = 0;
                }
                None => return internal_err!("more rows replayed than recorded in peer groups"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
    use windower_governor::{GovernorConfig, ResourceGovernor};

    use super::*;
    use crate::physical_plan::window::buffer::SpillMetrics;

    fn batch(values: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn evaluator(
        kind: WindowFunctionKind,
        governor: &ResourceGovernor,
        force_spill: bool,
        batch_size: usize,
    ) -> RelativeRankEvaluator {
        let metrics = SpillMetrics::new(&ExecutionPlanMetricsSet::new(), 0);
        let peer_sizes = PartitionBuffer::new(
            "peer groups",
            RelativeRankEvaluator::peer_group_schema(),
            governor.clone(),
            force_spill,
            metrics.clone(),
        );
        RelativeRankEvaluator::try_new(
            kind,
            &batch(vec![]).schema(),
            &[(0, SortOptions::default())],
            peer_sizes,
            batch_size,
        )
        .unwrap()
    }

    fn run(
        kind: WindowFunctionKind,
        partition: &[Vec<Option<i64>>],
        force_spill: bool,
        batch_size: usize,
    ) -> Vec<f64> {
        let governor = GovernorConfig::default().build().unwrap();
        let metrics = SpillMetrics::new(&ExecutionPlanMetricsSet::new(), 0);
        let mut rows = PartitionBuffer::new(
            "rows",
            batch(vec![]).schema(),
            governor.clone(),
            force_spill,
            metrics,
        );
        for values in partition {
            rows.append(batch(values.clone())).unwrap();
        }
        rows.seal().unwrap();

        let mut eval = evaluator(kind, &governor, force_spill, batch_size);
        eval.compute_peer_groups(rows.replay().unwrap()).unwrap();
        let out = rows
            .replay()
            .unwrap()
            .flat_map(|b| {
                let values = eval.evaluate(&b.unwrap()).unwrap();
                values.as_primitive::<arrow::datatypes::Float64Type>().values().to_vec()
            })
            .collect();
        eval.finish_partition();
        assert_eq!(governor.reserved_memory(), 0);
        out
    }

    #[test]
    fn peer_groups_spanning_batches() {
        let partition = vec![
            vec![None, None, Some(1)],
            vec![Some(1)],
            vec![Some(1), Some(2), Some(3)],
            vec![Some(3)],
        ];
        for (force_spill, batch_size) in [(false, 1024), (true, 1), (true, 2)] {
            assert_eq!(
                run(WindowFunctionKind::PercentRank, &partition, force_spill, batch_size),
                vec![0.0, 0.0, 2.0 / 7.0, 2.0 / 7.0, 2.0 / 7.0, 5.0 / 7.0, 6.0 / 7.0, 6.0 / 7.0]
            );
            assert_eq!(
                run(WindowFunctionKind::CumeDist, &partition, force_spill, batch_size),
                vec![0.25, 0.25, 0.625, 0.625, 0.625, 0.75, 1.0, 1.0]
            );
        }
    }

    #[test]
    fn single_row_partition() {
        let partition = vec![vec![Some(4)]];
        assert_eq!(run(WindowFunctionKind::PercentRank, &partition, false, 8), vec![0.0]);
        assert_eq!(run(WindowFunctionKind::CumeDist, &partition, false, 8), vec![1.0]);
    }

    #[test]
    fn evaluating_more_rows_than_recorded_fails() {
        let governor = GovernorConfig::default().build().unwrap();
        let mut eval = evaluator(WindowFunctionKind::CumeDist, &governor, false, 8);
        assert!(eval.evaluate(&batch(vec![Some(1)])).is_err());

        eval.compute_peer_groups(BufferReplay::Memory(vec![batch(vec![Some(1)])].into_iter()))
            .unwrap();
        assert_eq!(eval.partition_size(), 1);
        assert!(eval.evaluate(&batch(vec![Some(1), Some(1)])).is_err());
    }
}
