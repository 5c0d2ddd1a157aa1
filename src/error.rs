//! Error types for simulator setup.
//!
//! Runtime attempt failures are not errors: workers encode them into
//! `AttemptResult.error` and the result processor applies them as state.
//! `SimError` covers what can go wrong before the simulation runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// A numeric run parameter is outside its allowed range.
    #[error("{name} must be {requirement} (got {value})")]
    InvalidParameter {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },

    /// The output directory is empty or unusable.
    #[error("out_dir must be a non-empty path")]
    EmptyOutDir,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub(crate) fn invalid(name: &'static str, requirement: &'static str, value: f64) -> Self {
        SimError::InvalidParameter {
            name,
            requirement,
            value,
        }
    }
}
