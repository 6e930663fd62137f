//! Error types for the denoising engine.
//!
//! Setup errors (`InvalidDimension`, `SizeMismatch`, `InvalidParameter`,
//! `RunInProgress`) are raised before the first iteration and leave no
//! partial state behind.
//! `RunFailed` reports breakage during iteration. Cancellation is not an
//! error; see [`crate::engine::RunOutcome::Aborted`].

use thiserror::Error;

use crate::params::ModelKind;

/// Root error type for all engine failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DenoiseError {
    /// Lattice extent is zero (or negative at a binding boundary).
    #[error("invalid lattice dimension: {width}x{height}")]
    InvalidDimension { width: i64, height: i64 },

    /// A caller buffer does not match the lattice size.
    #[error("{buffer} buffer has {actual} elements, expected {expected}")]
    SizeMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A coefficient is missing, malformed, or outside its allowed range.
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: String, reason: String },

    /// Another run on the same engine has not finished yet.
    #[error("a run is already in flight on this engine")]
    RunInProgress,

    /// The solver produced an unusable state mid-run.
    #[error("{model} run failed at iteration {iteration}: {reason}")]
    RunFailed {
        model: ModelKind,
        iteration: usize,
        reason: String,
    },
}

impl DenoiseError {
    pub(crate) fn invalid_parameter(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DenoiseError::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type DenoiseResult<T> = Result<T, DenoiseError>;
