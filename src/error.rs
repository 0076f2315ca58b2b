use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlError>;

#[derive(Error, Debug)]
pub enum FlError {
    #[error("shape mismatch at tensor {index}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("parameter set has {actual} tensors, expected {expected}")]
    TensorCount { expected: usize, actual: usize },

    #[error("tensor {index} declares {declared} elements but holds {actual}")]
    MalformedTensor {
        index: usize,
        declared: usize,
        actual: usize,
    },

    #[error("client {client} rejected the global model: {reason}")]
    Incompatible { client: String, reason: String },

    #[error("total sample weight is zero")]
    ZeroTotalWeight,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("local training failed: {0}")]
    Training(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FlError {
    /// Shape errors mean client and server disagree on the model; nothing else is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlError::ShapeMismatch { .. }
                | FlError::TensorCount { .. }
                | FlError::MalformedTensor { .. }
                | FlError::Incompatible { .. }
        )
    }
}

impl From<candle_core::Error> for FlError {
    fn from(err: candle_core::Error) -> Self {
        FlError::Training(err.to_string())
    }
}

impl From<std::io::Error> for FlError {
    fn from(err: std::io::Error) -> Self {
        FlError::Checkpoint(err.to_string())
    }
}

impl From<serde_json::Error> for FlError {
    fn from(err: serde_json::Error) -> Self {
        FlError::Checkpoint(err.to_string())
    }
}

impl From<reqwest::Error> for FlError {
    fn from(err: reqwest::Error) -> Self {
        FlError::Transport(err.to_string())
    }
}
