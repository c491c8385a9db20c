//! Error type shared by binding, neighbor search and evaluation.

use thiserror::Error;

/// Everything that can go wrong while binding particle arrays and groups or
/// while running a `compute` pass.
///
/// Apart from `ThreadPool`, all variants are configuration errors that are
/// detected before any particle property is touched.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("particle array name '{0}' is used more than once")]
    DuplicateArray(String),

    #[error("unknown particle array '{0}'")]
    UnknownArray(String),

    #[error("particle array '{array}' declares property '{property}' more than once")]
    DuplicateProperty { array: String, property: String },

    #[error("particle array '{array}': '{property}' has {got} entries, expected {expected}")]
    LengthMismatch {
        array: String,
        property: String,
        expected: usize,
        got: usize,
    },

    #[error("particle array '{array}': {num_real} real particles exceed the total of {num_all}")]
    RealCountExceedsTotal {
        array: String,
        num_real: usize,
        num_all: usize,
    },

    #[error("particle array '{array}' has no property '{property}'")]
    MissingProperty { array: String, property: String },

    #[error("particle array '{array}' has no constant '{constant}'")]
    MissingConstant { array: String, constant: String },

    #[error("particle array '{array}': constant '{constant}' has {got} entries, at least {expected} required")]
    ConstantTooShort {
        array: String,
        constant: String,
        expected: usize,
        got: usize,
    },

    #[error("equation '{equation}' lists source '{source_array}' more than once")]
    DuplicateSource { equation: String, source_array: String },

    #[error("group '{group}': invalid iteration bounds (min {min}, max {max})")]
    InvalidIterationBounds { group: String, min: usize, max: usize },

    #[error("group '{0}' has equations with sources but no neighbor source is attached")]
    MissingNeighborSource(String),

    #[error("kernel dimension must be 1, 2 or 3 (got {0})")]
    InvalidDimension(usize),

    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
