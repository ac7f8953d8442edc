//! Error taxonomy for nonlinear fitting.
//!
//! Every failure mode of a fit has its own variant so callers can tell a caller-side
//! programming error (wrong dimensions, too few observations) from a numerical outcome
//! (no convergence, undefined uncertainty) or a failure inside their own model.

use ndarray::Array1;

use crate::model::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    /// The model returned a prediction vector whose length does not match the observations,
    /// or the independent and dependent samples differ in length.
    #[error("dimension mismatch: expected {expected} values, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// There must be strictly more observations than fitted parameters for the residual
    /// variance to be defined.
    #[error(
        "insufficient degrees of freedom: {observations} observations cannot constrain {parameters} parameters"
    )]
    InsufficientDegreesOfFreedom {
        observations: usize,
        parameters: usize,
    },

    /// The minimiser exhausted its iteration budget.
    #[error("no convergence after {iterations} iterations (residual norm {residual_norm:e})")]
    NotConverged {
        iterations: u64,
        /// The last iterate reached
        params: Array1<f64>,
        residual_norm: f64,
    },

    /// The Jacobian at the optimum does not have full column rank. The parameter values may
    /// well have converged, but their uncertainties are undefined.
    #[error("jacobian is rank deficient at the optimum (rank {rank} of {parameters})")]
    SingularJacobian {
        params: Array1<f64>,
        rank: usize,
        parameters: usize,
    },

    /// The caller-supplied model failed during a trial evaluation.
    #[error("model evaluation failed")]
    Model(#[source] ModelError),

    /// The model produced NaN or an infinity.
    #[error("model produced a non-finite prediction for sample {index}")]
    NonFinite { index: usize },

    /// An observation is NaN or infinite, so no sum of squares can be formed.
    #[error("observation {index} is not finite")]
    NonFiniteObservation { index: usize },

    #[error("initial guess for parameter {index} is not finite")]
    NonFiniteGuess { index: usize },

    #[error("significance level must lie in (0, 1), got {0}")]
    InvalidSignificance(f64),

    #[error("the t distribution needs at least one degree of freedom")]
    ZeroDegreesOfFreedom,

    /// A solver option lies outside the range in which the minimiser terminates.
    #[error("option `{name}` = {value} is invalid, it must be {requirement}")]
    InvalidOption {
        name: &'static str,
        value: f64,
        requirement: &'static str,
    },

    #[error("initial guess must contain at least one parameter")]
    EmptyGuess,

    /// Any other failure raised by the optimisation machinery
    #[error("solver failure: {0}")]
    Solver(String),
}

impl FitError {
    /// Recover a `FitError` which crossed the argmin boundary.
    ///
    /// Errors raised inside the operator are carried through argmin as its opaque error type,
    /// here we downcast them back so the caller's original model error is not stringified.
    pub(crate) fn from_argmin(error: argmin::core::Error) -> Self {
        match error.downcast::<Self>() {
            Ok(fit_error) => fit_error,
            Err(other) => Self::Solver(other.to_string()),
        }
    }

    /// The caller's model error, if this failure originated in the model.
    #[must_use]
    pub fn model_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Model(source) => Some(&**source),
            _ => None,
        }
    }
}
