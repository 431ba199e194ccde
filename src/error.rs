use std::fmt;

use thiserror::Error;

/// Custom error type for daesol
///
/// This error type is used to wrap all possible errors that can occur when integrating a DAE
#[derive(Error, Debug)]
pub enum DaeError {
    #[error("Linear solver error: {0}")]
    LinearSolverError(#[from] LinearSolverError),
    #[error("Non-linear solver error: {0}")]
    NonLinearSolverError(#[from] NonLinearSolverError),
    #[error("DAE solver error: {0}")]
    DaeSolverError(#[from] DaeSolverError),
    #[error("Matrix error: {0}")]
    MatrixError(#[from] MatrixError),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerializationError),
    #[error("Callback '{operation}' failed: {source}")]
    Callback {
        operation: &'static str,
        source: CallbackError,
    },
    #[error("Error: {0}")]
    Other(String),
}

impl DaeError {
    /// True if the integrator may retry with a smaller step or a fresh linearisation.
    ///
    /// Fatal callback failures, configuration errors and failures reported by the
    /// integrator itself are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaeError::Callback { source, .. } => source.is_recoverable(),
            DaeError::LinearSolverError(e) => e.is_recoverable(),
            DaeError::NonLinearSolverError(_) => true,
            _ => false,
        }
    }
}

/// Failure signalled by a user callback.
///
/// `Recoverable` asks the integrator to retry with an adjusted iterate or a smaller
/// step. It is consumed inside the integration core and never reaches the caller of
/// `advance` or `retreat` unless the retries are exhausted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallbackError {
    #[error("recoverable failure (status {0})")]
    Recoverable(i32),
    #[error("{0}")]
    Fatal(String),
}

impl CallbackError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CallbackError::Recoverable(_))
    }
}

/// Possible errors that can occur when solving a linear problem
#[derive(Error, Debug)]
pub enum LinearSolverError {
    #[error("LU not initialized")]
    LuNotInitialized,
    #[error("LU factorisation failed: {0}")]
    FactorisationFailed(String),
    #[error("LU solve produced non-finite values")]
    LuSolveFailed,
    #[error("Linear solver matrix not square")]
    LinearSolverMatrixNotSquare,
    #[error("Linear solver matrix not compatible with vector")]
    LinearSolverMatrixVectorNotCompatible,
    #[error("{method} did not converge after {iterations} iterations (residual {residual:e})")]
    KrylovDidNotConverge {
        method: &'static str,
        iterations: usize,
        residual: f64,
    },
    #[error("Error: {0}")]
    Other(String),
}

impl LinearSolverError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinearSolverError::FactorisationFailed(_)
                | LinearSolverError::LuSolveFailed
                | LinearSolverError::KrylovDidNotConverge { .. }
        )
    }
}

/// Possible errors that can occur when solving a non-linear problem
#[derive(Error, Debug)]
pub enum NonLinearSolverError {
    #[error("Newton iterations did not converge")]
    NewtonDidNotConverge,
    #[error("Newton iterations diverged")]
    NewtonDiverged,
    #[error("Error: {0}")]
    Other(String),
}

/// Symbolic status of a failed integrator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFlag {
    TooMuchWork,
    TooMuchAcc,
    ErrFail,
    ConvFail,
    LsetupFail,
    LsolveFail,
    ResFail,
    RepResErr,
    ConstrFail,
    IllInput,
    BadT,
    NoBck,
    NoFwd,
    GetyBadT,
}

impl SolverFlag {
    pub fn name(&self) -> &'static str {
        match self {
            SolverFlag::TooMuchWork => "TOO_MUCH_WORK",
            SolverFlag::TooMuchAcc => "TOO_MUCH_ACC",
            SolverFlag::ErrFail => "ERR_FAIL",
            SolverFlag::ConvFail => "CONV_FAIL",
            SolverFlag::LsetupFail => "LSETUP_FAIL",
            SolverFlag::LsolveFail => "LSOLVE_FAIL",
            SolverFlag::ResFail => "RES_FAIL",
            SolverFlag::RepResErr => "REP_RES_ERR",
            SolverFlag::ConstrFail => "CONSTR_FAIL",
            SolverFlag::IllInput => "ILL_INPUT",
            SolverFlag::BadT => "BAD_T",
            SolverFlag::NoBck => "NO_BCK",
            SolverFlag::NoFwd => "NO_FWD",
            SolverFlag::GetyBadT => "GETY_BADT",
        }
    }
}

impl fmt::Display for SolverFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Possible errors that can occur when integrating a DAE
#[derive(Debug, Error)]
pub enum DaeSolverError {
    #[error("{operation} returned \"{flag}\" at t = {time}: {detail}")]
    SolverFailure {
        operation: &'static str,
        flag: SolverFlag,
        time: f64,
        detail: String,
    },
    #[error(
        "Stop time = {} is less than current state time = {}",
        stop_time,
        state_time
    )]
    StopTimeBeforeCurrentTime { stop_time: f64, state_time: f64 },
    #[error("Stop time is at the current state time")]
    StopTimeAtCurrentTime,
    #[error("Step size is too small at time = {time}")]
    StepSizeTooSmall { time: f64 },
    #[error("Exceeded maximum number of error test failures at time = {time}")]
    TooManyErrorTestFailures { time: f64 },
    #[error("Interpolation time {t} is outside the recorded trajectory [{t_min}, {t_max}]")]
    InterpolationOutOfRange { t: f64, t_min: f64, t_max: f64 },
    #[error("'{0}' called before reset")]
    NotReset(&'static str),
    #[error("Backward problem {slot} has not been reset")]
    BackwardNotReset { slot: usize },
    #[error("Backward problem index {slot} out of range (have {count})")]
    BackwardSlotOutOfRange { slot: usize, count: usize },
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors for matrix operations
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Block of shape {block:?} at offset {offset:?} does not fit in a {target:?} matrix")]
    BlockOutOfBounds {
        block: (usize, usize),
        offset: (usize, usize),
        target: (usize, usize),
    },
    #[error("Work buffer has length {found}, need at least {expected}")]
    WorkBufferTooSmall { expected: usize, found: usize },
    #[error("Invalid sparse pattern: {0}")]
    SparseFormat(#[from] nalgebra_sparse::SparseFormatError),
    #[error("Index out of bounds")]
    IndexOutOfBounds,
    #[error("Error: {0}")]
    Other(String),
}

/// Problems detected while validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'{name}' has length {found}, expected {expected}")]
    DimensionMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Initial value {value} of state {index} violates constraint {constraint}")]
    ConstraintViolated {
        index: usize,
        value: f64,
        constraint: i32,
    },
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("Unknown option '{0}'")]
    UnknownOption(String),
    #[error("Option '{name}' expects a value of type {expected}")]
    WrongOptionType {
        name: String,
        expected: &'static str,
    },
}

/// Problems reading or writing a persisted integrator record
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Unsupported record version {found} (this build reads {oldest}..={current})")]
    UnsupportedVersion { found: u32, oldest: u32, current: u32 },
    #[error("Failed to decode record: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("Failed to encode record: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[macro_export]
macro_rules! linear_solver_error {
    ($variant:ident) => {
        DaeError::from(LinearSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        DaeError::from(LinearSolverError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! non_linear_solver_error {
    ($variant:ident) => {
        DaeError::from(NonLinearSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        DaeError::from(NonLinearSolverError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! dae_solver_error {
    ($variant:ident) => {
        DaeError::from(DaeSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        DaeError::from(DaeSolverError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! config_error {
    ($variant:ident { $($field:tt)* }) => {
        DaeError::from(ConfigError::$variant { $($field)* })
    };
    ($variant:ident, $($arg:tt)*) => {
        DaeError::from(ConfigError::$variant($($arg)*))
    };
}

#[macro_export]
macro_rules! other_error {
    ($msg:expr) => {
        DaeError::Other($msg.to_string())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let e = DaeError::Callback {
            operation: "residual",
            source: CallbackError::Recoverable(1),
        };
        assert!(e.is_recoverable());
        let e = DaeError::Callback {
            operation: "residual",
            source: CallbackError::Fatal("nan in model".to_string()),
        };
        assert!(!e.is_recoverable());
        assert!(DaeError::from(LinearSolverError::LuSolveFailed).is_recoverable());
        assert!(!DaeError::from(ConfigError::UnknownOption("foo".into())).is_recoverable());
    }

    #[test]
    fn solver_failure_reports_flag_name() {
        let e = DaeError::from(DaeSolverError::SolverFailure {
            operation: "advance",
            flag: SolverFlag::TooMuchWork,
            time: 0.5,
            detail: "reached max_num_steps".to_string(),
        });
        let msg = e.to_string();
        assert!(msg.contains("advance"));
        assert!(msg.contains("TOO_MUCH_WORK"));
    }
}
