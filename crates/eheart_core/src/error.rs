//! Error types for the simulation engine.

use thiserror::Error;

use crate::engine::EngineStatus;
use crate::expression::ExpressionError;
use crate::solvers::SolverError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{operation} requires the engine to be {required} (current state: {status:?})")]
    InvalidState {
        operation: &'static str,
        required: &'static str,
        status: EngineStatus,
    },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid model declaration: {0}")]
    Declaration(String),

    #[error("Unknown differential variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown constant: {0}")]
    UnknownConstant(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Time {t} is outside the solution interval [{start}, {end}]")]
    OutOfRange { t: f64, start: f64, end: f64 },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("Solver failed: {0}")]
    Solver(SolverError),

    #[error("Model error: {0:#}")]
    Model(anyhow::Error),
}

impl From<SolverError> for EngineError {
    fn from(err: SolverError) -> Self {
        match err {
            SolverError::System(inner) => match inner.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(other) => EngineError::Model(other),
            },
            other => EngineError::Solver(other),
        }
    }
}
