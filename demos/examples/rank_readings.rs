use std::sync::Arc;

use arrow::util::pretty::pretty_format_batches;
use datafusion::physical_plan::{collect, displayable, memory::MemoryExec, ExecutionPlan};
use datafusion::prelude::{SessionConfig, SessionContext};

use windower::prelude::*;
use windower_demos::{measurements_batch, sample_measurements, split_batch};

const CONFIG: &str = r#"{
    "partition_by": [0],
    "window_functions": [
        {"kind": "ROW_NUMBER", "ordering": [{"column_index": 1}], "output_column_index": 2},
        {"kind": "RANK", "ordering": [{"column_index": 1}], "output_column_index": 3},
        {"kind": "DENSE_RANK", "ordering": [{"column_index": 1}], "output_column_index": 4},
        {"kind": "PERCENT_RANK", "ordering": [{"column_index": 1}], "output_column_index": 5},
        {"kind": "CUME_DIST", "ordering": [{"column_index": 1}], "output_column_index": 6}
    ]
}"#;

/// Ranks sensor readings per sensor with all five functions under a memory
/// budget small enough to force the partitions to disk.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let batch = measurements_batch(&sample_measurements(40, 7))?;
    let schema = batch.schema();
    let input = Arc::new(MemoryExec::try_new(&[split_batch(&batch, 8)], schema, None)?);

    let spill_dir = tempfile::tempdir()?;
    let governor = GovernorConfig::default()
        .with_memory_limit(2048)
        .with_max_open_files(16)
        .with_spill_directory(spill_dir.path())
        .build()?;

    let exec = Arc::new(WindowExec::try_new(
        WindowOperatorConfig::from_json(CONFIG)?,
        input,
        governor.clone(),
    )?);
    println!("{}", displayable(exec.as_ref()).indent(true));

    let ctx = SessionContext::new_with_config(
        SessionConfig::new().with_option_extension(WindowerConfig::default()),
    );
    let batches = collect(exec.clone(), ctx.task_ctx()).await?;
    println!("{}", pretty_format_batches(&batches)?);

    if let Some(metrics) = exec.metrics() {
        println!(
            "output rows: {:?}, spills: {:?}, spilled rows: {:?}",
            metrics.output_rows(),
            metrics.spill_count(),
            metrics.spilled_rows()
        );
    }
    println!(
        "held file handles: {}, reserved memory: {}",
        governor.held_file_handles(),
        governor.reserved_memory()
    );

    Ok(())
}
