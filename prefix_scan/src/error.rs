use thiserror::Error;

/// Failures surfaced by a scan. None of them are retried; a buffer that was
/// being scanned when one occurred must not be reused.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no compute device available: {0}")]
    DeviceUnavailable(String),
    #[error("kernel compilation failed:\n{log}")]
    CompilationFailure { log: String },
    #[error("device error during {operation}: code {code}")]
    DeviceExecution { operation: &'static str, code: i64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ScanError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ScanError::InvalidArgument(message.into())
    }
}
