use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid model config: {0}")]
    InvalidConfig(String),

    #[error("Cannot forward sequence of length {seq_len}, block size is only {max_seq_len}")]
    SequenceTooLong { seq_len: i64, max_seq_len: i64 },

    #[error("Target shape {found:?} does not match input shape {expected:?}")]
    TargetShape { expected: Vec<i64>, found: Vec<i64> },

    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("Unknown model preset: {0}")]
    UnknownPreset(String),

    #[error("Unsupported dtype in checkpoint: {0}")]
    UnsupportedDtype(String),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
