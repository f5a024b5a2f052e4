use thiserror::Error;

/// Failures a pipeline run or a report download can end with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("document contains no usable student rows")]
    EmptyRoster,

    #[error("insufficient training data: {0}")]
    InsufficientTrainingData(String),

    #[error("no report available for session `{0}`; generate one first")]
    NoReportAvailable(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for PipelineError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        PipelineError::Internal(format!("spreadsheet serialization failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
