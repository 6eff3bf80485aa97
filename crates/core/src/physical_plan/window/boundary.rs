use std::sync::Arc;

use arrow::row::{OwnedRow, Row, RowConverter, SortField};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{Schema, SortOptions};
use datafusion::common::{plan_err, Result};

/// Builds the row-format fields for `columns`, rejecting indices outside the
/// schema and types that have no total order in the row format.
pub(crate) fn sort_fields(schema: &Schema, columns: &[(usize, SortOptions)]) -> Result<Vec<SortField>> {
    let width = schema.fields().len();
    let mut fields = Vec::with_capacity(columns.len());
    for &(idx, options) in columns {
        if idx >= width {
            return plan_err!("column index {idx} is out of range for an input with {width} columns");
        }
        let field = SortField::new_with_options(schema.field(idx).data_type().clone(), options);
        if !RowConverter::supports_fields(std::slice::from_ref(&field)) {
            return plan_err!(
                "column {idx} of type {} cannot be compared to find window boundaries",
                schema.field(idx).data_type()
            );
        }
        fields.push(field);
    }
    Ok(fields)
}

/// Detects where a sorted stream of rows moves on to a new group of equal
/// values on a fixed list of columns.
///
/// Rows are compared in the Arrow row format, where NULL is equal to NULL
/// and different from every non-null value. The last row of each batch is
/// retained so that a group continuing into the next batch is not split.
/// Without columns every row belongs to one group.
pub struct BoundaryTracker {
    columns: Vec<usize>,
    converter: Option<RowConverter>,
    last_row: Option<OwnedRow>,
}

impl BoundaryTracker {
    pub fn try_new(schema: &Schema, columns: &[(usize, SortOptions)]) -> Result<Self> {
        let fields = sort_fields(schema, columns)?;
        let converter = if fields.is_empty() {
            None
        } else {
            Some(RowConverter::new(fields)?)
        };
        Ok(Self {
            columns: columns.iter().map(|(idx, _)| *idx).collect(),
            converter,
            last_row: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether `cur` starts a new group given that `prev` came right before it.
    pub fn is_new_group(&self, prev: Row<'_>, cur: Row<'_>) -> bool {
        self.converter.is_some() && prev != cur
    }

    /// Returns the ascending offsets of the rows in `batch` that start a new
    /// group. Offset 0 is reported only when it differs from the last row of
    /// the previous batch; the first row ever seen never starts a group.
    pub fn boundaries(&mut self, batch: &RecordBatch) -> Result<Vec<usize>> {
        let Some(converter) = &self.converter else {
            return Ok(vec![]);
        };
        if batch.num_rows() == 0 {
            return Ok(vec![]);
        }

        let columns: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|&idx| Arc::clone(batch.column(idx)))
            .collect();
        let rows = converter.convert_columns(&columns)?;

        let mut starts = Vec::new();
        if let Some(last) = &self.last_row {
            if self.is_new_group(last.row(), rows.row(0)) {
                starts.push(0);
            }
        }
        for idx in 1..rows.num_rows() {
            if self.is_new_group(rows.row(idx - 1), rows.row(idx)) {
                starts.push(idx);
            }
        }
        self.last_row = Some(rows.row(rows.num_rows() - 1).owned());
        Ok(starts)
    }

    /// Forgets the retained row, so the next batch opens a fresh group.
    pub fn reset(&mut self) {
        self.last_row = None;
    }
}
