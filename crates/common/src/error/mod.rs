use std::result;
use thiserror::Error;

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use serde_json::Error as JsonError;

/// Result type for operations that could result in a [WindowerError]
pub type Result<T, E = WindowerError> = result::Result<T, E>;

/// Windower Error
#[derive(Error, Debug)]
pub enum WindowerError {
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),
    #[error("Invalid window operator configuration: {0}")]
    Config(String),
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("Json error: {0}")]
    Json(#[from] JsonError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<WindowerError> for DataFusionError {
    fn from(error: WindowerError) -> Self {
        match error {
            WindowerError::DataFusion(e) => e,
            WindowerError::Arrow(e) => DataFusionError::ArrowError(e, None),
            WindowerError::Config(msg) => DataFusionError::Plan(msg),
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_back_into_datafusion_errors() {
        let err: DataFusionError = WindowerError::Config("bad output column".to_string()).into();
        assert!(matches!(err, DataFusionError::Plan(msg) if msg == "bad output column"));

        let err: DataFusionError =
            WindowerError::DataFusion(DataFusionError::ResourcesExhausted("disk".into())).into();
        assert!(matches!(err, DataFusionError::ResourcesExhausted(_)));
    }

    #[test]
    fn json_errors_are_wrapped() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: WindowerError = err.into();
        assert!(err.to_string().starts_with("Json error"));
    }
}
