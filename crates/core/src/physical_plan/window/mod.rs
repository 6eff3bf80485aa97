pub mod boundary;
pub mod buffer;
pub mod combiner;
pub mod config;
pub mod functions;
pub mod spill_queue;
pub mod window_exec;

pub use buffer::{BufferReplay, PartitionBuffer, SpillMetrics};
pub use config::{OrderingColumn, SortDirection, WindowFunctionConfig, WindowOperatorConfig};
pub use functions::WindowFunctionKind;
pub use window_exec::{WindowExec, WindowStream};

#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::Path;
    use std::sync::Arc;

    use arrow::array::AsArray;
    use arrow::compute::{cast, lexsort_to_indices, take_record_batch, SortColumn};
    use arrow::datatypes::{Float64Type, Int64Type};
    use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch};
    use arrow_schema::{DataType, Field, Schema, SortOptions};

    /// Input columns of a row, then every window function output as `f64`.
    pub type Rows = Vec<(Vec<Option<i64>>, Vec<f64>)>;

    /// Regular files anywhere below `dir`.
    pub fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .map(|path| {
                if path.is_dir() {
                    count_files(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    /// Nullable Int64 columns `c0..c{width}`.
    pub fn int_batch(width: usize, rows: &[Vec<Option<i64>>]) -> RecordBatch {
        let fields: Vec<Field> = (0..width)
            .map(|idx| Field::new(format!("c{idx}"), DataType::Int64, true))
            .collect();
        let columns: Vec<ArrayRef> = (0..width)
            .map(|idx| {
                Arc::new(Int64Array::from(
                    rows.iter().map(|row| row[idx]).collect::<Vec<_>>(),
                )) as ArrayRef
            })
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
    }

    /// Sorts ascending on `columns` with NULLs first.
    pub fn sort_batch(batch: &RecordBatch, columns: &[usize]) -> RecordBatch {
        if columns.is_empty() {
            return batch.clone();
        }
        let sort_columns: Vec<SortColumn> = columns
            .iter()
            .map(|&idx| SortColumn {
                values: Arc::clone(batch.column(idx)),
                options: Some(SortOptions {
                    descending: false,
                    nulls_first: true,
                }),
            })
            .collect();
        let indices = lexsort_to_indices(&sort_columns, None).unwrap();
        take_record_batch(batch, &indices).unwrap()
    }

    pub fn chunks(batch: &RecordBatch, size: usize) -> Vec<RecordBatch> {
        (0..batch.num_rows())
            .step_by(size)
            .map(|offset| batch.slice(offset, size.min(batch.num_rows() - offset)))
            .collect()
    }

    pub fn output_rows(batches: &[RecordBatch], width: usize) -> Rows {
        let mut rows = vec![];
        for batch in batches {
            let inputs: Vec<_> = (0..width)
                .map(|idx| batch.column(idx).as_primitive::<Int64Type>().clone())
                .collect();
            let outputs: Vec<_> = (width..batch.num_columns())
                .map(|idx| {
                    cast(batch.column(idx), &DataType::Float64)
                        .unwrap()
                        .as_primitive::<Float64Type>()
                        .clone()
                })
                .collect();
            for row in 0..batch.num_rows() {
                rows.push((
                    inputs
                        .iter()
                        .map(|c| (!c.is_null(row)).then(|| c.value(row)))
                        .collect(),
                    outputs.iter().map(|c| c.value(row)).collect(),
                ));
            }
        }
        rows
    }
}
