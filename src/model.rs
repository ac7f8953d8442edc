use ndarray::Array1;

/// Error raised by a caller-supplied model.
///
/// The fitter never inspects it, it is handed back to the caller unchanged inside
/// [`crate::FitError::Model`].
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// A parametric model mapping independent-variable samples to predictions.
///
/// `X` is the type of a single independent-variable sample, a scalar `f64` for simple rate
/// laws or a vector type when each observation has several covariates. Implementations must
/// return exactly one prediction per sample and must be free of side effects, as the fitter
/// evaluates them many times at trial parameter values.
///
/// A model which cannot produce a value for some trial parameters (an embedded ODE
/// integration that blows up, a root solve that fails) must return an error rather than a
/// placeholder value.
pub trait Model<X> {
    /// Predict the dependent variable at every sample in `x` for parameters `params`
    ///
    /// # Errors
    /// Returns the model's own error when it cannot be evaluated at `params`.
    fn evaluate(&self, x: &[X], params: &Array1<f64>) -> Result<Array1<f64>, ModelError>;
}

impl<X, F> Model<X> for F
where
    F: Fn(&[X], &Array1<f64>) -> Result<Array1<f64>, ModelError>,
{
    fn evaluate(&self, x: &[X], params: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        self(x, params)
    }
}
