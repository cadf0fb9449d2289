use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient data: need at least {required} readings, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("model not trained")]
    NotTrained,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("computation error: {0}")]
    Computation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectError {
    /// True for errors that mean "not enough input", which callers report as
    /// an empty result rather than a failure.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, DetectError::InsufficientData { .. })
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;
