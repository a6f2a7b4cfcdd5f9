//! Error taxonomy for the archnet pipeline.

use std::fmt::Display;
use thiserror::Error;

/// Errors raised by archnet operations.
///
/// Configuration and resource errors abort the whole pipeline. Solver non-convergence is
/// not an error, see [`crate::archetype::Convergence`].
#[derive(Debug, Error)]
pub enum ArchnetError {
    /// A parameter is outside its valid range. Raised before any computation starts.
    #[error("invalid configuration: {param} = {value}, valid range is {range}")]
    InvalidConfig {
        /// Name of the offending parameter
        param: &'static str,
        /// Value that was supplied
        value: String,
        /// Valid range for the parameter
        range: String,
    },

    /// The run would exceed its time or memory budget.
    #[error("{resource} budget exhausted: required {required}, limit {limit}")]
    ResourceExhausted {
        /// `"time"` or `"memory"`
        resource: &'static str,
        /// Amount the run needed (or had used when it was stopped)
        required: String,
        /// Configured limit
        limit: String,
    },

    /// The run was cancelled through its [`crate::budget::BudgetState`].
    #[error("computation was cancelled")]
    Cancelled,

    /// Failure inside the linear algebra backend.
    #[error("numerical failure: {0}")]
    Numerical(#[from] anyhow::Error),
}

impl ArchnetError {
    pub(crate) fn invalid(param: &'static str, value: impl Display, range: impl Display) -> ArchnetError {
        ArchnetError::InvalidConfig {
            param,
            value: value.to_string(),
            range: range.to_string(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = ArchnetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_message_names_param_and_range() {
        let e = ArchnetError::invalid("k", 12, "[2, 10]");
        let msg = e.to_string();
        assert!(msg.contains("k = 12"), "{msg}");
        assert!(msg.contains("[2, 10]"), "{msg}");
    }
}
