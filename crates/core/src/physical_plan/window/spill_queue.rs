use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::SchemaRef;
use datafusion::common::{internal_err, DataFusionError, Result};
use datafusion::execution::disk_manager::RefCountedTempFile;

pub type SpillReader = StreamReader<BufReader<File>>;

/// FIFO queue of record batches kept in an Arrow IPC stream file.
///
/// Batches are appended until [`SpillQueue::finish`]; after that any number
/// of independent readers can be opened. The backing file is deleted when
/// the queue is dropped.
pub struct SpillQueue {
    file: RefCountedTempFile,
    writer: Option<StreamWriter<BufWriter<File>>>,
    num_batches: usize,
    num_rows: usize,
    bytes_written: usize,
}

impl SpillQueue {
    pub fn try_new(file: RefCountedTempFile, schema: &SchemaRef) -> Result<Self> {
        let out = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(file.path())
            .map_err(|e| DataFusionError::Execution(format!("Failed to open spill file: {e}")))?;
        let writer = StreamWriter::try_new(BufWriter::new(out), schema)?;
        Ok(Self {
            file,
            writer: Some(writer),
            num_batches: 0,
            num_rows: 0,
            bytes_written: 0,
        })
    }

    pub fn enqueue(&mut self, batch: &RecordBatch) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return internal_err!("cannot enqueue into a finished spill queue");
        };
        writer.write(batch)?;
        self.num_batches += 1;
        self.num_rows += batch.num_rows();
        self.bytes_written += batch.get_array_memory_size();
        Ok(())
    }

    /// Closes the queue for writing. Calling it again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
            writer.get_mut().flush()?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_none()
    }

    /// Opens a reader positioned at the first enqueued batch.
    pub fn dequeue_in_order(&self) -> Result<SpillReader> {
        if !self.is_finished() {
            return internal_err!("spill queue must be finished before it is read");
        }
        let file = File::open(self.file.path())
            .map_err(|e| DataFusionError::Execution(format!("Failed to open spill file: {e}")))?;
        Ok(StreamReader::try_new(BufReader::new(file), None)?)
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::AsArray;
    use arrow::datatypes::Int64Type;
    use arrow_array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use datafusion::execution::disk_manager::{DiskManager, DiskManagerConfig};

    use super::*;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn read_all(queue: &SpillQueue) -> Vec<i64> {
        queue
            .dequeue_in_order()
            .unwrap()
            .flat_map(|b| {
                b.unwrap()
                    .column(0)
                    .as_primitive::<Int64Type>()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    #[test]
    fn batches_come_back_in_order_any_number_of_times() {
        let disk = DiskManager::try_new(DiskManagerConfig::NewOs).unwrap();
        let first = batch(vec![1, 2, 3]);
        let mut queue =
            SpillQueue::try_new(disk.create_tmp_file("test").unwrap(), &first.schema()).unwrap();
        queue.enqueue(&first).unwrap();
        queue.enqueue(&batch(vec![4])).unwrap();
        assert!(queue.dequeue_in_order().is_err());

        queue.finish().unwrap();
        queue.finish().unwrap();
        assert!(queue.enqueue(&batch(vec![5])).is_err());
        assert_eq!(queue.num_batches(), 2);
        assert_eq!(queue.num_rows(), 4);

        assert_eq!(read_all(&queue), vec![1, 2, 3, 4]);
        assert_eq!(read_all(&queue), vec![1, 2, 3, 4]);
    }
}
