use std::sync::Arc;

use arrow::util::pretty::pretty_format_batches;
use datafusion::physical_plan::{execute_stream, memory::MemoryExec};
use datafusion::prelude::{SessionConfig, SessionContext};
use futures::StreamExt;

use windower::prelude::*;
use windower_demos::{measurements_batch, sample_measurements, split_batch};

/// Streaming-only functions emit a batch for every input batch and never
/// touch disk, so this runs without any file handles.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let batch = measurements_batch(&sample_measurements(24, 11))?;
    let schema = batch.schema();
    let input = Arc::new(MemoryExec::try_new(&[split_batch(&batch, 6)], schema, None)?);

    let ordering = vec![OrderingColumn::asc(1)];
    let config = WindowOperatorConfig::new(
        vec![0],
        vec![
            WindowFunctionConfig::new(WindowFunctionKind::RowNumber, 2)
                .with_ordering(ordering.clone())
                .with_output_name("position"),
            WindowFunctionConfig::new(WindowFunctionKind::DenseRank, 3)
                .with_ordering(ordering)
                .with_output_name("place"),
        ],
    );
    let governor = GovernorConfig::default().with_max_open_files(0).build()?;
    let exec = Arc::new(WindowExec::try_new(config, input, governor)?);

    let ctx = SessionContext::new_with_config(SessionConfig::new());
    let mut stream = execute_stream(exec, ctx.task_ctx())?;
    while let Some(batch) = stream.next().await {
        println!("{}", pretty_format_batches(&[batch?])?);
    }
    Ok(())
}
