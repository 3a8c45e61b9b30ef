use thiserror::Error;

/// Unified error type for `octopo` operations.
#[derive(Debug, Error)]
pub enum OptError {
    /// Raised when a required configuration entry is absent.
    #[error("missing required parameter `{name}`")]
    MissingParameter {
        /// Dotted configuration key, e.g. `volume.target_fraction`.
        name: &'static str,
    },

    /// Raised when a numeric configuration entry is outside its admissible range.
    #[error("parameter `{name}` = {value} is invalid: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Raised when an enumerated option carries an unrecognised value.
    #[error("unknown value `{value}` for `{name}`; valid options are {expected}")]
    UnknownOption {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Raised when the optimizer is used before a simulation interface is bound.
    #[error("optimizer requires a bound simulation interface")]
    UnboundInterface,

    /// Raised when an operation is requested in a state that does not allow it.
    #[error("cannot {operation} while the optimizer is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Raised when field or gradient buffers have incompatible lengths.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// Raised when the multiplier search cannot meet the acceptable volume tolerance.
    #[error(
        "enforcement of volume fraction {target} failed after {iterations} iterations: \
         relative residual {residual:e} exceeds acceptable tolerance {tolerance:e}"
    )]
    VolumeEnforcementFailed {
        /// Volume fraction that was being enforced.
        target: f64,
        /// Final residual, normalized by the total design volume.
        residual: f64,
        /// Acceptable relative tolerance.
        tolerance: f64,
        /// Iterations spent in the final search phase.
        iterations: usize,
    },

    /// Raised when numerical routines produce NaN or degenerate scalars.
    #[error("encountered a degenerate value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the simulation collaborator reports a failure.
    #[error("simulation interface failed: {message}")]
    Simulation { message: String },
}

impl OptError {
    /// Helper to format a [`DimensionMismatch`](OptError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    pub fn missing_parameter(name: &'static str) -> Self {
        Self::MissingParameter { name }
    }

    pub fn invalid_parameter(name: &'static str, value: f64, reason: &'static str) -> Self {
        Self::InvalidParameter {
            name,
            value,
            reason,
        }
    }

    /// Helper for collaborators that surface their own failures as text.
    pub fn simulation<M: Into<String>>(message: M) -> Self {
        Self::Simulation {
            message: message.into(),
        }
    }

    /// Returns `true` for the configuration family of errors, which are never recoverable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::UnknownOption { .. }
                | Self::UnboundInterface
        )
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, OptError>;
