use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use datafusion::common::{internal_err, stats::Precision, DataFusionError, Result, Statistics};
use datafusion::execution::{RecordBatchStream, SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::{
    expressions::Column, EquivalenceProperties, PhysicalExpr, PhysicalSortRequirement,
};
use datafusion::physical_plan::{
    metrics::{BaselineMetrics, ExecutionPlanMetricsSet, MetricsSet},
    DisplayAs, DisplayFormatType, Distribution, ExecutionPlan, ExecutionPlanProperties,
    PlanProperties,
};
use futures::future::BoxFuture;
use futures::{ready, FutureExt, Stream, StreamExt};
use itertools::Itertools;
use tracing::debug;
use windower_governor::{FileHandlePermit, ResourceGovernor};

use crate::config_extensions::windower_config::WindowerConfig;

use super::boundary::BoundaryTracker;
use super::buffer::{BufferReplay, PartitionBuffer, SpillMetrics};
use super::combiner::OutputCombiner;
use super::config::{SortDirection, WindowOperatorConfig};
use super::functions::WindowFunctionEvaluator;

/// Computes ranking window functions over input sorted by the partition
/// columns followed by each function's ordering columns.
///
/// The output is the input columns followed by one column per function, in
/// input order. Streaming-only configurations emit every batch as it
/// arrives; otherwise each partition is buffered (spilling to disk under
/// memory pressure) and emitted once it closes.
#[derive(Debug)]
pub struct WindowExec {
    input: Arc<dyn ExecutionPlan>,
    config: WindowOperatorConfig,
    governor: ResourceGovernor,
    schema: SchemaRef,
    metrics: ExecutionPlanMetricsSet,
    cache: PlanProperties,
}

impl WindowExec {
    pub fn try_new(
        config: WindowOperatorConfig,
        input: Arc<dyn ExecutionPlan>,
        governor: ResourceGovernor,
    ) -> Result<Self> {
        let input_schema = input.schema();
        config.validate(&input_schema)?;

        let required = config.required_file_handles();
        if required > governor.max_file_handles() {
            return Err(DataFusionError::ResourcesExhausted(format!(
                "window operator needs {required} file handles but at most {} can be open",
                governor.max_file_handles()
            )));
        }

        let schema = OutputCombiner::try_new(&input_schema, &config.window_functions)?.schema();
        let cache = Self::compute_properties(&input, schema.clone());
        Ok(Self {
            input,
            config,
            governor,
            schema,
            metrics: ExecutionPlanMetricsSet::new(),
            cache,
        })
    }

    fn compute_properties(input: &Arc<dyn ExecutionPlan>, schema: SchemaRef) -> PlanProperties {
        // input columns keep their positions and rows keep their order, so
        // the input orderings and partitioning still describe the output
        let eq_properties =
            EquivalenceProperties::new(schema).extend(input.equivalence_properties().clone());
        PlanProperties::new(
            eq_properties,
            input.output_partitioning().clone(),
            input.execution_mode(),
        )
    }

    fn input_column(&self, idx: usize) -> Arc<dyn PhysicalExpr> {
        Arc::new(Column::new(self.input.schema().field(idx).name(), idx))
    }

    pub fn input(&self) -> &Arc<dyn ExecutionPlan> {
        &self.input
    }

    pub fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }
}

impl DisplayAs for WindowExec {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                let input_schema = self.input.schema();
                let partition_by = self
                    .config
                    .partition_by
                    .iter()
                    .map(|&idx| input_schema.field(idx).name())
                    .join(", ");
                let functions = self
                    .config
                    .window_functions
                    .iter()
                    .map(|function| {
                        let ordering = function
                            .ordering
                            .iter()
                            .map(|c| match c.direction {
                                SortDirection::Ascending => {
                                    input_schema.field(c.column_index).name().to_string()
                                }
                                SortDirection::Descending => {
                                    format!("{} DESC", input_schema.field(c.column_index).name())
                                }
                            })
                            .join(", ");
                        format!(
                            "{}() ORDER BY [{}] AS {}",
                            function.kind,
                            ordering,
                            self.schema.field(function.output_column_index).name()
                        )
                    })
                    .join(", ");
                write!(
                    f,
                    "WindowExec: partition_by=[{partition_by}], functions=[{functions}]"
                )
            }
        }
    }
}

impl ExecutionPlan for WindowExec {
    fn name(&self) -> &'static str {
        "WindowExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.cache
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![&self.input]
    }

    fn maintains_input_order(&self) -> Vec<bool> {
        vec![true]
    }

    fn required_input_distribution(&self) -> Vec<Distribution> {
        if self.config.partition_by.is_empty() {
            return vec![Distribution::SinglePartition];
        }
        let exprs = self
            .config
            .partition_by
            .iter()
            .map(|&idx| self.input_column(idx))
            .collect();
        vec![Distribution::HashPartitioned(exprs)]
    }

    fn required_input_ordering(&self) -> Vec<Option<Vec<PhysicalSortRequirement>>> {
        let requirement: Vec<_> = self
            .config
            .input_sort_columns()
            .into_iter()
            .map(|(idx, options)| PhysicalSortRequirement::new(self.input_column(idx), Some(options)))
            .collect();
        if requirement.is_empty() {
            vec![None]
        } else {
            vec![Some(requirement)]
        }
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        let [input] = children.as_slice() else {
            return internal_err!("WindowExec expects exactly one child");
        };
        Ok(Arc::new(WindowExec::try_new(
            self.config.clone(),
            Arc::clone(input),
            self.governor.clone(),
        )?))
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> Result<SendableRecordBatchStream> {
        let options = context
            .session_config()
            .options()
            .extensions
            .get::<WindowerConfig>()
            .cloned()
            .unwrap_or_default();

        debug!(
            "executing WindowExec partition {partition} (force_disk_spill: {})",
            options.force_disk_spill
        );
        let input = self.input.execute(partition, Arc::clone(&context))?;
        Ok(Box::pin(WindowStream::try_new(
            input,
            &self.config,
            self.governor.clone(),
            &options,
            BaselineMetrics::new(&self.metrics, partition),
            SpillMetrics::new(&self.metrics, partition),
        )?))
    }

    fn metrics(&self) -> Option<MetricsSet> {
        Some(self.metrics.clone_inner())
    }

    fn statistics(&self) -> Result<Statistics> {
        Ok(Statistics {
            num_rows: self.input.statistics()?.num_rows,
            total_byte_size: Precision::Absent,
            column_statistics: Statistics::unknown_column(&self.schema),
        })
    }
}

enum StreamState {
    AcquiringFileHandles(BoxFuture<'static, Result<FileHandlePermit>>),
    Running,
    Done,
}

/// An input batch, or the part of one, not yet handed to the evaluators.
struct PendingInput {
    batch: RecordBatch,
    /// Offsets in `batch` where a new partition begins.
    partition_starts: Vec<usize>,
}

pub struct WindowStream {
    schema: SchemaRef,
    input: SendableRecordBatchStream,
    state: StreamState,
    partitions: BoundaryTracker,
    evaluators: Vec<WindowFunctionEvaluator>,
    combiner: OutputCombiner,
    /// Rows of the open partition. Only present when a function needs the
    /// whole partition.
    rows: Option<PartitionBuffer>,
    pending: Option<PendingInput>,
    /// Second pass over the closed partition.
    drain: Option<BufferReplay>,
    input_done: bool,
    permit: Option<FileHandlePermit>,
    baseline_metrics: BaselineMetrics,
}

impl WindowStream {
    pub fn try_new(
        input: SendableRecordBatchStream,
        config: &WindowOperatorConfig,
        governor: ResourceGovernor,
        options: &WindowerConfig,
        baseline_metrics: BaselineMetrics,
        spill_metrics: SpillMetrics,
    ) -> Result<Self> {
        let input_schema = input.schema();
        config.validate(&input_schema)?;

        let combiner = OutputCombiner::try_new(&input_schema, &config.window_functions)?;
        let partitions = BoundaryTracker::try_new(&input_schema, &config.partition_columns())?;
        let evaluators = config
            .window_functions
            .iter()
            .map(|function| {
                WindowFunctionEvaluator::try_new(
                    function,
                    &input_schema,
                    &governor,
                    options,
                    &spill_metrics,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = config.has_materializing_functions().then(|| {
            PartitionBuffer::new(
                "WindowExec rows",
                input_schema,
                governor.clone(),
                options.force_disk_spill,
                spill_metrics.clone(),
            )
        });

        let required = config.required_file_handles();
        let state = if required > 0 {
            StreamState::AcquiringFileHandles(governor.acquire_file_handles(required))
        } else {
            StreamState::Running
        };

        Ok(Self {
            schema: combiner.schema(),
            input,
            state,
            partitions,
            evaluators,
            combiner,
            rows,
            pending: None,
            drain: None,
            input_done: false,
            permit: None,
            baseline_metrics,
        })
    }

    fn poll_next_inner(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<RecordBatch>>> {
        if let StreamState::AcquiringFileHandles(acquire) = &mut self.state {
            match ready!(acquire.poll_unpin(cx)) {
                Ok(permit) => {
                    debug!("acquired {} file handles", permit.count());
                    self.permit = Some(permit);
                    self.state = StreamState::Running;
                }
                Err(e) => {
                    self.release_resources();
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
        if let StreamState::Done = self.state {
            return Poll::Ready(None);
        }

        let poll = self.advance(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.release_resources();
        }
        poll
    }

    fn advance(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<RecordBatch>>> {
        loop {
            match self.next_output() {
                Ok(Some(batch)) => return Poll::Ready(Some(Ok(batch))),
                Ok(None) => {}
                Err(e) => return Poll::Ready(Some(Err(e))),
            }
            if self.input_done {
                return Poll::Ready(None);
            }

            match ready!(self.input.poll_next_unpin(cx)) {
                Some(Ok(batch)) => {
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    match self.partitions.boundaries(&batch) {
                        Ok(partition_starts) => {
                            self.pending = Some(PendingInput {
                                batch,
                                partition_starts,
                            })
                        }
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    self.input_done = true;
                    if let Err(e) = self.close_partition() {
                        return Poll::Ready(Some(Err(e)));
                    }
                }
            }
        }
    }

    /// Produces the next output batch from what has been read so far, or
    /// `None` when more input is needed.
    fn next_output(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(batch) = self.next_replayed()? {
                return Ok(Some(batch));
            }
            let Some(pending) = self.pending.take() else {
                return Ok(None);
            };
            if self.rows.is_none() {
                return self.evaluate_streaming(pending).map(Some);
            }
            self.buffer_pending(pending)?;
        }
    }

    fn evaluate_streaming(&mut self, pending: PendingInput) -> Result<RecordBatch> {
        let outputs = self
            .evaluators
            .iter_mut()
            .map(|e| e.evaluate_streaming(&pending.batch, &pending.partition_starts))
            .collect::<Result<Vec<_>>>()?;
        self.combiner.combine(&pending.batch, outputs)
    }

    /// Appends rows up to the next partition start and closes the open
    /// partition there; the rest stays pending until it has been emitted.
    fn buffer_pending(&mut self, pending: PendingInput) -> Result<()> {
        let Some(rows) = self.rows.as_mut() else {
            return internal_err!("no partition buffer for a materializing window function");
        };
        let PendingInput {
            batch,
            partition_starts,
        } = pending;

        let split = partition_starts
            .iter()
            .copied()
            .find(|&start| start > 0 || !rows.is_empty());
        let Some(split) = split else {
            return rows.append(batch);
        };
        if split > 0 {
            rows.append(batch.slice(0, split))?;
        }
        self.pending = Some(PendingInput {
            batch: batch.slice(split, batch.num_rows() - split),
            partition_starts: partition_starts
                .into_iter()
                .filter(|&start| start > split)
                .map(|start| start - split)
                .collect(),
        });
        self.close_partition()
    }

    fn close_partition(&mut self) -> Result<()> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }
        rows.seal()?;
        debug!(
            "closed partition of {} rows (spilled: {})",
            rows.num_rows(),
            rows.is_spilled()
        );
        for evaluator in self.evaluators.iter_mut() {
            evaluator.prepare_partition(rows)?;
        }
        self.drain = Some(rows.replay()?);
        Ok(())
    }

    fn next_replayed(&mut self) -> Result<Option<RecordBatch>> {
        let Some(drain) = self.drain.as_mut() else {
            return Ok(None);
        };
        match drain.next() {
            Some(batch) => {
                let batch = batch?;
                let outputs = self
                    .evaluators
                    .iter_mut()
                    .map(|e| e.evaluate_replayed(&batch))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(self.combiner.combine(&batch, outputs)?))
            }
            None => {
                self.drain = None;
                for evaluator in self.evaluators.iter_mut() {
                    evaluator.finish_partition();
                }
                if let Some(rows) = self.rows.as_mut() {
                    rows.release();
                }
                Ok(None)
            }
        }
    }

    /// Returns memory, spill files and file handles. The stream yields
    /// nothing afterwards.
    fn release_resources(&mut self) {
        self.state = StreamState::Done;
        self.pending = None;
        self.drain = None;
        for evaluator in self.evaluators.iter_mut() {
            evaluator.finish_partition();
        }
        if let Some(rows) = self.rows.as_mut() {
            rows.release();
        }
        self.permit = None;
    }
}

impl RecordBatchStream for WindowStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl Stream for WindowStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.poll_next_inner(cx);
        self.baseline_metrics.record_poll(poll)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}
