use arrow_array::{Array, RecordBatch};
use arrow_schema::SchemaRef;
use datafusion::common::{internal_err, DataFusionError, Result};
use datafusion::execution::memory_pool::MemoryReservation;
use datafusion::physical_plan::metrics::{Count, ExecutionPlanMetricsSet, MetricBuilder};
use tracing::debug;
use windower_governor::ResourceGovernor;

use super::spill_queue::{SpillQueue, SpillReader};

/// Spill counters shared by every buffer of one operator partition.
#[derive(Debug, Clone)]
pub struct SpillMetrics {
    spill_count: Count,
    spilled_bytes: Count,
    spilled_rows: Count,
}

impl SpillMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            spilled_rows: MetricBuilder::new(metrics).spilled_rows(partition),
        }
    }
}

/// Append-only store for the rows of one partition.
///
/// Batches stay in memory while the governor's memory pool grants the
/// reservation. The first denied reservation moves everything buffered so
/// far into a spill queue and every later append goes there too, which
/// keeps the replay order equal to the append order. Readers only see
/// [`BufferReplay`] and cannot tell the two backends apart.
///
/// The buffer is reused: [`PartitionBuffer::release`] drops the rows, the
/// reservation and the spill file and opens it for the next partition.
pub struct PartitionBuffer {
    name: String,
    schema: SchemaRef,
    governor: ResourceGovernor,
    reservation: MemoryReservation,
    batches: Vec<RecordBatch>,
    spill: Option<SpillQueue>,
    num_rows: usize,
    sealed: bool,
    force_spill: bool,
    metrics: SpillMetrics,
}

impl PartitionBuffer {
    pub fn new(
        name: impl Into<String>,
        schema: SchemaRef,
        governor: ResourceGovernor,
        force_spill: bool,
        metrics: SpillMetrics,
    ) -> Self {
        let name = name.into();
        let reservation = governor.register_consumer(name.clone());
        Self {
            name,
            schema,
            governor,
            reservation,
            batches: vec![],
            spill: None,
            num_rows: 0,
            sealed: false,
            force_spill,
            metrics,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn append(&mut self, batch: RecordBatch) -> Result<()> {
        if self.sealed {
            return internal_err!("{} is sealed and cannot accept more rows", self.name);
        }
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let num_rows = batch.num_rows();

        if self.spill.is_none() {
            let size = batch_memory_size(&batch)?;
            if !self.force_spill && self.reservation.try_grow(size).is_ok() {
                self.batches.push(batch);
                self.num_rows += num_rows;
                return Ok(());
            }
            self.spill_to_disk()?;
        }
        match self.spill.as_mut() {
            Some(queue) => enqueue(queue, &batch, &self.metrics)?,
            None => return internal_err!("{} has no spill queue after spilling", self.name),
        }
        self.num_rows += num_rows;
        Ok(())
    }

    fn spill_to_disk(&mut self) -> Result<()> {
        let file = self.governor.create_spill_file(&self.name)?;
        let mut queue = SpillQueue::try_new(file, &self.schema)?;
        let buffered_rows: usize = self.batches.iter().map(|b| b.num_rows()).sum();
        debug!(
            "{} spilling {} buffered rows ({} bytes reserved) to disk",
            self.name,
            buffered_rows,
            self.reservation.size()
        );
        for batch in self.batches.drain(..) {
            enqueue(&mut queue, &batch, &self.metrics)?;
        }
        self.reservation.free();
        self.metrics.spill_count.add(1);
        self.spill = Some(queue);
        Ok(())
    }

    /// Closes the buffer for writes. Sealing twice is allowed.
    pub fn seal(&mut self) -> Result<()> {
        if let Some(queue) = self.spill.as_mut() {
            queue.finish()?;
        }
        self.sealed = true;
        Ok(())
    }

    /// Starts a pass over the sealed rows in append order. Each call yields
    /// an independent cursor.
    pub fn replay(&self) -> Result<BufferReplay> {
        if !self.sealed {
            return internal_err!("{} must be sealed before it is replayed", self.name);
        }
        match &self.spill {
            Some(queue) => Ok(BufferReplay::Disk(queue.dequeue_in_order()?)),
            None => Ok(BufferReplay::Memory(self.batches.clone().into_iter())),
        }
    }

    /// Drops every row, frees the reservation and deletes the spill file.
    pub fn release(&mut self) {
        self.batches.clear();
        self.reservation.free();
        self.spill = None;
        self.num_rows = 0;
        self.sealed = false;
    }
}

/// Bytes of the buffers `batch` actually spans. Slices of a larger batch
/// share its buffers, so the whole allocation would overstate them.
pub(crate) fn batch_memory_size(batch: &RecordBatch) -> Result<usize> {
    batch
        .columns()
        .iter()
        .map(|column| -> Result<usize> { Ok(column.to_data().get_slice_memory_size()?) })
        .sum()
}

fn enqueue(queue: &mut SpillQueue, batch: &RecordBatch, metrics: &SpillMetrics) -> Result<()> {
    queue.enqueue(batch)?;
    metrics.spilled_rows.add(batch.num_rows());
    metrics.spilled_bytes.add(batch_memory_size(batch)?);
    Ok(())
}

/// One forward pass over a sealed [`PartitionBuffer`].
pub enum BufferReplay {
    Memory(std::vec::IntoIter<RecordBatch>),
    Disk(SpillReader),
}

impl Iterator for BufferReplay {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BufferReplay::Memory(batches) => batches.next().map(Ok),
            BufferReplay::Disk(reader) => reader
                .next()
                .map(|batch| batch.map_err(|e| DataFusionError::ArrowError(e, None))),
        }
    }
}
