use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tracker data: {0}")]
    FormatInvalid(String),

    #[error("shape dimension mismatch: expected {expected}, got {got}")]
    ShapeDimensionMismatch { expected: usize, got: usize },

    #[error("similarity transform is rank deficient")]
    RankDeficientTransform,

    #[error("fit called with zero samples")]
    EmptyTrainingSet,

    #[error("no initial detection rectangle available")]
    DetectionMissing,
}

pub type Result<T> = std::result::Result<T, Error>;
