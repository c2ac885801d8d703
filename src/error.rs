use thiserror::Error;

use crate::config::{KiloBytes, Millis};

/// A malformed request, rejected before anything is executed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown language `{0}`")]
    UnknownLanguage(String),
    #[error("Source code is empty")]
    EmptySource,
    #[error("Source code is {size} bytes, the maximum is {max}")]
    SourceTooLarge { size: usize, max: usize },
    #[error("At least one test case is required")]
    NoTestCases,
    #[error("{count} test cases submitted, the maximum is {max}")]
    TooManyTestCases { count: usize, max: usize },
    #[error("Test case index {0} appears more than once")]
    DuplicateIndex(u32),
    #[error("Test case {index} is malformed: {reason}")]
    MalformedTestCase { index: u32, reason: &'static str },
    #[error("Time and memory limits must be positive")]
    InvalidLimits,
    #[error(
        "Limits {} ms / {} KB exceed the maximum {} ms / {} KB",
        .time.0, .memory.0, .max_time.0, .max_memory.0
    )]
    LimitsTooLarge {
        time: Millis,
        memory: KiloBytes,
        max_time: Millis,
        max_memory: KiloBytes,
    },
    #[error("Run id `{0}` must be 1 to 64 characters of letters, digits, `-`, `_` or `.`")]
    InvalidRunId(String),
    #[error("Run `{0}` is already in progress")]
    RunIdInUse(String),
}

/// Run-level failure of [`crate::intake::Intake::submit`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Run `{run_id}` was cancelled")]
    Cancelled { run_id: String },
}
