use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use datafusion::error::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Measurement {
    pub sensor_name: String,
    pub reading: Option<i64>,
}

const SENSORS: [&str; 4] = ["sensor_0", "sensor_1", "sensor_2", "sensor_3"];

/// Random readings with ties and the occasional missing value.
pub fn sample_measurements(count: usize, seed: u64) -> Vec<Measurement> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Measurement {
            sensor_name: SENSORS.choose(&mut rng).unwrap_or(&SENSORS[0]).to_string(),
            reading: rng.gen_bool(0.9).then(|| rng.gen_range(60..70)),
        })
        .collect()
}

/// One batch of measurements sorted by sensor and reading, missing readings
/// first, the order the window operator expects.
pub fn measurements_batch(measurements: &[Measurement]) -> Result<RecordBatch> {
    let mut sorted = measurements.to_vec();
    sorted.sort();

    let schema = Arc::new(Schema::new(vec![
        Field::new("sensor_name", DataType::Utf8, false),
        Field::new("reading", DataType::Int64, true),
    ]));
    let sensors = StringArray::from_iter_values(sorted.iter().map(|m| m.sensor_name.as_str()));
    let readings: Int64Array = sorted.iter().map(|m| m.reading).collect();
    Ok(RecordBatch::try_new(
        schema,
        vec![Arc::new(sensors), Arc::new(readings)],
    )?)
}

pub fn split_batch(batch: &RecordBatch, size: usize) -> Vec<RecordBatch> {
    (0..batch.num_rows())
        .step_by(size.max(1))
        .map(|offset| batch.slice(offset, size.max(1).min(batch.num_rows() - offset)))
        .collect()
}
