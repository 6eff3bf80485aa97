use arrow_schema::{Schema, SortOptions};
use datafusion::common::{plan_err, Result};
use serde::{Deserialize, Serialize};
use windower_common::error::Result as WindowerResult;

use super::boundary::sort_fields;
use super::combiner::OutputCombiner;
use super::functions::{WindowFunctionKind, ROW_BUFFER_NUM_REQUIRED_FDS};

/// What the planner asks a window operator to compute.
///
/// ```json
/// {
///   "partition_by": [0],
///   "window_functions": [
///     {"kind": "CUME_DIST", "ordering": [{"column_index": 1}], "output_column_index": 2}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOperatorConfig {
    #[serde(default)]
    pub partition_by: Vec<usize>,
    pub window_functions: Vec<WindowFunctionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFunctionConfig {
    pub kind: WindowFunctionKind,
    #[serde(default)]
    pub ordering: Vec<OrderingColumn>,
    pub output_column_index: usize,
    #[serde(default)]
    pub filter_column_index: Option<usize>,
    #[serde(default)]
    pub output_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingColumn {
    pub column_index: usize,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderingColumn {
    pub fn asc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: SortDirection::Descending,
        }
    }

    /// NULLs sort before every value ascending and after every value
    /// descending.
    pub fn sort_options(&self) -> SortOptions {
        let descending = self.direction == SortDirection::Descending;
        SortOptions {
            descending,
            nulls_first: !descending,
        }
    }
}

impl WindowFunctionConfig {
    pub fn new(kind: WindowFunctionKind, output_column_index: usize) -> Self {
        Self {
            kind,
            ordering: vec![],
            output_column_index,
            filter_column_index: None,
            output_name: None,
        }
    }

    pub fn with_ordering(mut self, ordering: Vec<OrderingColumn>) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn sort_columns(&self) -> Vec<(usize, SortOptions)> {
        self.ordering
            .iter()
            .map(|c| (c.column_index, c.sort_options()))
            .collect()
    }
}

impl WindowOperatorConfig {
    pub fn new(partition_by: Vec<usize>, window_functions: Vec<WindowFunctionConfig>) -> Self {
        Self {
            partition_by,
            window_functions,
        }
    }

    pub fn from_json(json: &str) -> WindowerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn partition_columns(&self) -> Vec<(usize, SortOptions)> {
        self.partition_by
            .iter()
            .map(|&idx| (idx, SortOptions::default()))
            .collect()
    }

    /// The longest function ordering. Every function's ordering is a prefix
    /// of it once the configuration is validated.
    pub fn shared_ordering(&self) -> &[OrderingColumn] {
        self.window_functions
            .iter()
            .map(|f| f.ordering.as_slice())
            .max_by_key(|ordering| ordering.len())
            .unwrap_or(&[])
    }

    /// The order the input must arrive in: the partition columns ascending
    /// with NULLs first, then the shared ordering. Ordering columns that
    /// also partition are constant within a partition and are skipped.
    pub fn input_sort_columns(&self) -> Vec<(usize, SortOptions)> {
        let mut columns = self.partition_columns();
        columns.extend(
            self.shared_ordering()
                .iter()
                .filter(|c| !self.partition_by.contains(&c.column_index))
                .map(|c| (c.column_index, c.sort_options())),
        );
        columns
    }

    pub fn has_materializing_functions(&self) -> bool {
        self.window_functions.iter().any(|f| !f.kind.is_streaming())
    }

    /// Spill files this operator may hold open at the same time.
    pub fn required_file_handles(&self) -> usize {
        if !self.has_materializing_functions() {
            return 0;
        }
        ROW_BUFFER_NUM_REQUIRED_FDS
            + self
                .window_functions
                .iter()
                .map(|f| f.kind.num_required_file_handles())
                .sum::<usize>()
    }

    pub fn validate(&self, input_schema: &Schema) -> Result<()> {
        if self.window_functions.is_empty() {
            return plan_err!("a window operator needs at least one window function");
        }
        sort_fields(input_schema, &self.partition_columns())?;

        let width = input_schema.fields().len();
        for function in &self.window_functions {
            sort_fields(input_schema, &function.sort_columns())?;
            if let Some(idx) = function.filter_column_index {
                if idx >= width {
                    return plan_err!(
                        "filter column {idx} is out of range for an input with {width} columns"
                    );
                }
                return plan_err!("FILTER is not supported for ranking function {}", function.kind);
            }
        }
        let shared = self.shared_ordering();
        for function in &self.window_functions {
            if !shared.starts_with(&function.ordering) {
                return plan_err!(
                    "{} orders by {} but another window function orders by {}; \
                     one operator can only read its input in one order",
                    function.kind,
                    describe_ordering(&function.ordering),
                    describe_ordering(shared)
                );
            }
        }
        OutputCombiner::try_new(input_schema, &self.window_functions)?;
        Ok(())
    }
}

fn describe_ordering(ordering: &[OrderingColumn]) -> String {
    let columns: Vec<String> = ordering
        .iter()
        .map(|c| match c.direction {
            SortDirection::Ascending => format!("#{}", c.column_index),
            SortDirection::Descending => format!("#{} DESC", c.column_index),
        })
        .collect();
    format!("[{}]", columns.join(", "))
}
