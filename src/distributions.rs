use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::FitError;

/// Two-sided critical value of the Student t distribution
///
/// Returns $t$ such that a t-distributed variable with `degrees_of_freedom` degrees of freedom
/// lies in $[-t, t]$ with probability $1 - \alpha$, that is the $1 - \alpha / 2$ quantile.
///
/// # Errors
/// Returns [`FitError::InvalidSignificance`] unless $0 < \alpha < 1$, and
/// [`FitError::ZeroDegreesOfFreedom`] for zero degrees of freedom.
pub fn t_critical(alpha: f64, degrees_of_freedom: usize) -> Result<f64, FitError> {
    if !(alpha > 0. && alpha < 1.) {
        return Err(FitError::InvalidSignificance(alpha));
    }
    if degrees_of_freedom == 0 {
        return Err(FitError::ZeroDegreesOfFreedom);
    }

    #[allow(clippy::cast_precision_loss)]
    let distribution = StudentsT::new(0., 1., degrees_of_freedom as f64)
        .map_err(|e| FitError::Solver(e.to_string()))?;

    Ok(distribution.inverse_cdf(1. - alpha / 2.))
}
