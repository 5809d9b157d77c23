//! Construction-time error types.
//!
//! Everything that can go wrong is detectable when a component is built:
//! mismatched matrix shapes, empty or inverted bounds, non-positive
//! durations. Once construction succeeds, update and evaluation never fail;
//! runtime anomalies degrade to logged warnings instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Covariance matrices must be square
    #[error("covariance matrix must be square, got {rows}x{cols}")]
    NonSquareCovariance { rows: usize, cols: usize },

    /// A matrix parameter has the wrong shape
    #[error("{name} must be {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    MatrixShape {
        name: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    /// A vector parameter has the wrong length
    #[error("{name} must have length {expected}, got {actual}")]
    VectorLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A duration or scale parameter is outside its valid range
    #[error("{name} must be {constraint}, got {value}")]
    OutOfRange {
        name: &'static str,
        constraint: &'static str,
        value: f64,
    },

    /// Too few rollouts to hold the two reserved slots
    #[error("at least 2 rollouts are required, got {0}")]
    TooFewRollouts(usize),

    /// Warm-started rollouts would leave no slot for fresh samples
    #[error("keep_best_rollouts must be at most rollouts - 2 ({limit}), got {requested}")]
    TooManyKeptRollouts { requested: usize, limit: usize },

    /// Dynamics and cost disagree on their dimensions
    #[error("dynamics and cost disagree: dynamics is {dynamics}, cost is {cost} ({what})")]
    CapabilityMismatch {
        what: &'static str,
        dynamics: usize,
        cost: usize,
    },

    /// Per-coordinate control bounds are inverted
    #[error("control bound is empty at coordinate {coordinate}: min {min} > max {max}")]
    EmptyControlBound {
        coordinate: usize,
        min: f64,
        max: f64,
    },

    /// The rollout worker pool could not be created
    #[error("failed to build rollout worker pool: {0}")]
    WorkerPool(String),
}

pub type Result<T> = std::result::Result<T, Error>;
