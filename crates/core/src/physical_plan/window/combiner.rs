use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{Field, Schema, SchemaRef};
use datafusion::common::{internal_err, plan_err, Result};

use super::config::WindowFunctionConfig;

/// Appends one output column per window function to the input columns.
///
/// Function `i` of the configuration writes the column at its output
/// index; the output indices must cover `input_width..input_width + k`
/// exactly, in any order.
///
/// Output names must be unique across the whole row. An explicit name that
/// is already taken is rejected; a default name gets the first free
/// `_1`, `_2`, ... suffix.
#[derive(Debug, Clone)]
pub struct OutputCombiner {
    schema: SchemaRef,
    input_width: usize,
    /// For each appended column, the function producing it.
    column_sources: Vec<usize>,
}

impl OutputCombiner {
    pub fn try_new(input_schema: &Schema, functions: &[WindowFunctionConfig]) -> Result<Self> {
        let input_width = input_schema.fields().len();
        let mut column_sources: Vec<Option<usize>> = vec![None; functions.len()];
        for (function_idx, function) in functions.iter().enumerate() {
            let out = function.output_column_index;
            if out < input_width || out >= input_width + functions.len() {
                return plan_err!(
                    "output column {out} of {} must be in {input_width}..{}",
                    function.kind,
                    input_width + functions.len()
                );
            }
            let slot = &mut column_sources[out - input_width];
            if slot.is_some() {
                return plan_err!("output column {out} is written by more than one window function");
            }
            *slot = Some(function_idx);
        }
        let column_sources: Vec<usize> = column_sources.into_iter().flatten().collect();

        let mut fields: Vec<Field> = input_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        let mut taken: HashSet<String> = fields.iter().map(|f| f.name().clone()).collect();
        let mut names: Vec<Option<String>> = vec![None; functions.len()];
        for &function_idx in &column_sources {
            if let Some(name) = &functions[function_idx].output_name {
                if !taken.insert(name.clone()) {
                    return plan_err!("output column name {name} is used more than once");
                }
                names[function_idx] = Some(name.clone());
            }
        }
        for &function_idx in &column_sources {
            if names[function_idx].is_none() {
                let base = functions[function_idx].kind.name();
                let mut name = base.to_string();
                let mut suffix = 1;
                while taken.contains(&name) {
                    name = format!("{base}_{suffix}");
                    suffix += 1;
                }
                taken.insert(name.clone());
                names[function_idx] = Some(name);
            }
        }
        for &function_idx in &column_sources {
            let function = &functions[function_idx];
            fields.push(Field::new(
                names[function_idx].take().unwrap_or_default(),
                function.kind.output_data_type(),
                false,
            ));
        }
        let schema = Arc::new(Schema::new_with_metadata(
            fields,
            input_schema.metadata().clone(),
        ));

        Ok(Self {
            schema,
            input_width,
            column_sources,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// `outputs[i]` is the column computed by function `i` for `batch`.
    pub fn combine(&self, batch: &RecordBatch, outputs: Vec<ArrayRef>) -> Result<RecordBatch> {
        if batch.num_columns() != self.input_width || outputs.len() != self.column_sources.len() {
            return internal_err!(
                "expected {} input and {} output columns, got {} and {}",
                self.input_width,
                self.column_sources.len(),
                batch.num_columns(),
                outputs.len()
            );
        }
        let mut columns = batch.columns().to_vec();
        columns.extend(self.column_sources.iter().map(|&idx| Arc::clone(&outputs[idx])));
        Ok(RecordBatch::try_new(self.schema.clone(), columns)?)
    }
}
