use std::fmt;
use std::str::FromStr;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, SchemaRef};
use datafusion::common::{internal_err, plan_err, DataFusionError, Result};
use serde::{Deserialize, Serialize};
use windower_governor::ResourceGovernor;

use crate::config_extensions::windower_config::WindowerConfig;

use super::buffer::{PartitionBuffer, SpillMetrics};
use super::config::WindowFunctionConfig;

pub mod rank;
pub mod relative_rank;

pub use rank::RankEvaluator;
pub use relative_rank::RelativeRankEvaluator;

/// Spill queues a relative rank evaluator may hold open at once on top of
/// the operator's shared row buffer: its buffer of peer group sizes.
pub const RELATIVE_RANK_NUM_REQUIRED_FDS: usize = 1;

/// Spill queues owned by the operator itself whenever any materializing
/// function is configured: the shared row buffer.
pub const ROW_BUFFER_NUM_REQUIRED_FDS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowFunctionKind {
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
}

impl WindowFunctionKind {
    pub fn name(&self) -> &'static str {
        match self {
            WindowFunctionKind::RowNumber => "row_number",
            WindowFunctionKind::Rank => "rank",
            WindowFunctionKind::DenseRank => "dense_rank",
            WindowFunctionKind::PercentRank => "percent_rank",
            WindowFunctionKind::CumeDist => "cume_dist",
        }
    }

    /// Streaming functions emit a value per row as soon as the row arrives.
    /// The others need the whole partition first.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            WindowFunctionKind::RowNumber | WindowFunctionKind::Rank | WindowFunctionKind::DenseRank
        )
    }

    pub fn output_data_type(&self) -> DataType {
        if self.is_streaming() {
            DataType::Int64
        } else {
            DataType::Float64
        }
    }

    pub fn num_required_file_handles(&self) -> usize {
        if self.is_streaming() {
            0
        } else {
            RELATIVE_RANK_NUM_REQUIRED_FDS
        }
    }
}

impl fmt::Display for WindowFunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name().to_uppercase())
    }
}

impl FromStr for WindowFunctionKind {
    type Err = DataFusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "row_number" => Ok(WindowFunctionKind::RowNumber),
            "rank" => Ok(WindowFunctionKind::Rank),
            "dense_rank" => Ok(WindowFunctionKind::DenseRank),
            "percent_rank" => Ok(WindowFunctionKind::PercentRank),
            "cume_dist" => Ok(WindowFunctionKind::CumeDist),
            _ => plan_err!("unknown window function: {s}"),
        }
    }
}

/// Evaluator for one configured window function.
///
/// Streaming evaluators run inline over the input batches. Materializing
/// evaluators make a first pass over a sealed partition in
/// [`WindowFunctionEvaluator::prepare_partition`] and then produce values
/// while the partition is replayed a second time.
pub enum WindowFunctionEvaluator {
    Streaming(RankEvaluator),
    Materializing(RelativeRankEvaluator),
}

impl WindowFunctionEvaluator {
    pub fn try_new(
        function: &WindowFunctionConfig,
        input_schema: &SchemaRef,
        governor: &ResourceGovernor,
        options: &WindowerConfig,
        metrics: &SpillMetrics,
    ) -> Result<Self> {
        let ordering = function.sort_columns();
        if function.kind.is_streaming() {
            Ok(WindowFunctionEvaluator::Streaming(RankEvaluator::try_new(
                function.kind,
                input_schema,
                &ordering,
            )?))
        } else {
            let peer_groups = PartitionBuffer::new(
                format!("{} peer groups", function.kind),
                RelativeRankEvaluator::peer_group_schema(),
                governor.clone(),
                options.force_disk_spill,
                metrics.clone(),
            );
            Ok(WindowFunctionEvaluator::Materializing(
                RelativeRankEvaluator::try_new(
                    function.kind,
                    input_schema,
                    &ordering,
                    peer_groups,
                    options.peer_group_batch_size,
                )?,
            ))
        }
    }

    pub fn kind(&self) -> WindowFunctionKind {
        match self {
            WindowFunctionEvaluator::Streaming(e) => e.kind(),
            WindowFunctionEvaluator::Materializing(e) => e.kind(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, WindowFunctionEvaluator::Streaming(_))
    }

    /// Row-synchronous evaluation of input as it arrives. `partition_starts`
    /// are the offsets in `batch` where a new partition begins.
    pub fn evaluate_streaming(
        &mut self,
        batch: &RecordBatch,
        partition_starts: &[usize],
    ) -> Result<ArrayRef> {
        match self {
            WindowFunctionEvaluator::Streaming(e) => e.evaluate(batch, partition_starts),
            WindowFunctionEvaluator::Materializing(e) => internal_err!(
                "{} needs the whole partition and cannot be evaluated inline",
                e.kind()
            ),
        }
    }

    /// Called once a partition has been sealed and before it is replayed.
    pub fn prepare_partition(&mut self, rows: &PartitionBuffer) -> Result<()> {
        match self {
            WindowFunctionEvaluator::Streaming(e) => {
                e.reset();
                Ok(())
            }
            WindowFunctionEvaluator::Materializing(e) => e.compute_peer_groups(rows.replay()?),
        }
    }

    /// Evaluates a batch replayed from the sealed partition, in order.
    pub fn evaluate_replayed(&mut self, batch: &RecordBatch) -> Result<ArrayRef> {
        match self {
            WindowFunctionEvaluator::Streaming(e) => e.evaluate(batch, &[]),
            WindowFunctionEvaluator::Materializing(e) => e.evaluate(batch),
        }
    }

    pub fn finish_partition(&mut self) {
        if let WindowFunctionEvaluator::Materializing(e) = self {
            e.finish_partition();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kinds_case_insensitively() {
        assert_eq!(
            "PERCENT_RANK".parse::<WindowFunctionKind>().unwrap(),
            WindowFunctionKind::PercentRank
        );
        assert_eq!(
            "dense_rank".parse::<WindowFunctionKind>().unwrap(),
            WindowFunctionKind::DenseRank
        );
        assert!("ntile".parse::<WindowFunctionKind>().is_err());
    }

    #[test]
    fn classifies_kinds() {
        assert!(WindowFunctionKind::Rank.is_streaming());
        assert!(!WindowFunctionKind::CumeDist.is_streaming());
        assert_eq!(WindowFunctionKind::RowNumber.output_data_type(), DataType::Int64);
        assert_eq!(WindowFunctionKind::CumeDist.output_data_type(), DataType::Float64);
        assert_eq!(WindowFunctionKind::DenseRank.num_required_file_handles(), 0);
        assert_eq!(WindowFunctionKind::DenseRank.to_string(), "DENSE_RANK");
    }
}
