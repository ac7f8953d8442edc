//! Nonlinear regression with confidence intervals.
//!
//! A fit runs in three stages:
//!
//! 1. Levenberg-Marquardt minimisation of the sum of squared residuals from the caller's guess.
//! 2. Parameter covariance from the Jacobian $J$ of the model at the optimum,
//!    $$
//!        \Sigma = \sigma^2 \left(J^T J\right)^{-1}, \qquad \sigma^2 = \frac{SSE}{n - p},
//!    $$
//!    where $n$ is the number of observations and $p$ the number of parameters.
//! 3. Intervals $\hat\theta_i \pm t_{1 - \alpha/2, n - p} \sqrt{\Sigma_{ii}}$.
//!
//! # Covariance convention
//!
//! The reported covariance is always scaled by the residual variance $\sigma^2$ estimated from
//! the fit itself, so observation noise is treated as unknown and homoscedastic. The unscaled
//! $(J^T J)^{-1}$ is never reported. A fit with zero residuals therefore has zero covariance
//! and zero-width intervals, no minimum width is imposed.

use ndarray::{Array1, Array2};

use crate::config::FitOptions;
use crate::distributions::t_critical;
use crate::error::FitError;
use crate::math::inverse_normal_matrix;
use crate::minimisation::FitProblem;
use crate::model::Model;
use crate::observations::ObservationSet;

/// The outcome of a successful fit
///
/// Parameters, standard errors and intervals are all ordered as the initial guess was.
#[derive(Clone, Debug, PartialEq)]
pub struct FitResult {
    params: Array1<f64>,
    standard_errors: Array1<f64>,
    intervals: Vec<(f64, f64)>,
    alpha: f64,
    t_value: f64,
    covariance: Array2<f64>,
    residuals: Array1<f64>,
    sse: f64,
    total_sum_of_squares: f64,
    degrees_of_freedom: usize,
    iterations: u64,
    relative_step: f64,
}

impl FitResult {
    pub const fn params(&self) -> &Array1<f64> {
        &self.params
    }

    pub const fn standard_errors(&self) -> &Array1<f64> {
        &self.standard_errors
    }

    /// Lower and upper bound of the $(1 - \alpha)$ confidence interval of each parameter
    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Critical value of the t distribution the intervals were scaled by
    pub const fn t_value(&self) -> f64 {
        self.t_value
    }

    /// Parameter covariance, scaled by the residual variance
    pub const fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Model prediction minus observation at the optimum
    pub const fn residuals(&self) -> &Array1<f64> {
        &self.residuals
    }

    /// Sum of squared residuals at the optimum
    pub const fn sse(&self) -> f64 {
        self.sse
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn residual_variance(&self) -> f64 {
        self.sse / self.degrees_of_freedom as f64
    }

    pub const fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }

    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Relative central-difference step the Jacobian was taken with
    pub const fn relative_step(&self) -> f64 {
        self.relative_step
    }

    /// Confidence intervals for the same fit at a different significance level
    ///
    /// # Errors
    /// Returns [`FitError::InvalidSignificance`] unless $0 < \alpha < 1$.
    pub fn intervals_at(&self, alpha: f64) -> Result<Vec<(f64, f64)>, FitError> {
        let t_value = t_critical(alpha, self.degrees_of_freedom)?;
        Ok(intervals(&self.params, &self.standard_errors, t_value))
    }

    /// Correlation matrix of the parameters
    ///
    /// Returns `None` when any standard error is zero, as the correlation is then undefined.
    pub fn correlation(&self) -> Option<Array2<f64>> {
        if self.standard_errors.iter().any(|&se| se == 0.) {
            return None;
        }
        let p = self.params.len();
        Some(Array2::from_shape_fn((p, p), |(ii, jj)| {
            self.covariance[[ii, jj]] / (self.standard_errors[ii] * self.standard_errors[jj])
        }))
    }

    /// Coefficient of determination, `None` if the observations are all equal
    pub fn r_squared(&self) -> Option<f64> {
        (self.total_sum_of_squares > 0.).then(|| 1. - self.sse / self.total_sum_of_squares)
    }
}

fn intervals(params: &Array1<f64>, standard_errors: &Array1<f64>, t_value: f64) -> Vec<(f64, f64)> {
    params
        .iter()
        .zip(standard_errors.iter())
        .map(|(value, se)| (value - t_value * se, value + t_value * se))
        .collect()
}

/// Fits models to data with the options it was built with
///
/// The fitter holds no state between calls, independent datasets can be fitted concurrently
/// from a shared reference.
#[derive(Clone, Debug, Default)]
pub struct NonlinearFitter {
    options: FitOptions,
}

impl NonlinearFitter {
    pub const fn new(options: FitOptions) -> Self {
        Self { options }
    }

    pub const fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Fit `model` to the observations `y` made at `x`, starting from `guess`
    ///
    /// Intervals are reported at the significance level of the fitter's options.
    ///
    /// # Errors
    /// - [`FitError::InvalidOption`] when the fitter's options are out of range
    /// - [`FitError::EmptyGuess`] when `guess` is empty
    /// - [`FitError::NonFiniteGuess`] or [`FitError::NonFiniteObservation`] for NaN or
    ///   infinite inputs
    /// - [`FitError::DimensionMismatch`] when `x` and `y`, or the model output and `y`, differ
    ///   in length
    /// - [`FitError::InsufficientDegreesOfFreedom`] unless there are more observations than
    ///   parameters
    /// - [`FitError::InvalidSignificance`] for a significance outside (0, 1)
    /// - [`FitError::NotConverged`] when the iteration budget runs out
    /// - [`FitError::SingularJacobian`] when the parameters are not all identifiable at the
    ///   optimum
    /// - [`FitError::Model`] or [`FitError::NonFinite`] when the model fails at any trial point
    pub fn fit<M, X>(
        &self,
        model: &M,
        x: &[X],
        y: &Array1<f64>,
        guess: &Array1<f64>,
    ) -> Result<FitResult, FitError>
    where
        M: Model<X>,
    {
        let options = &self.options;
        options.validate()?;
        let (n, p) = (y.len(), guess.len());

        if p == 0 {
            return Err(FitError::EmptyGuess);
        }
        if let Some(index) = guess.iter().position(|value| !value.is_finite()) {
            return Err(FitError::NonFiniteGuess { index });
        }
        if x.len() != n {
            return Err(FitError::DimensionMismatch {
                expected: x.len(),
                found: n,
            });
        }
        if let Some(index) = y.iter().position(|value| !value.is_finite()) {
            return Err(FitError::NonFiniteObservation { index });
        }
        if n <= p {
            return Err(FitError::InsufficientDegreesOfFreedom {
                observations: n,
                parameters: p,
            });
        }
        let degrees_of_freedom = n - p;
        let t_value = t_critical(options.alpha, degrees_of_freedom)?;

        let problem = FitProblem::new(model, x, y, options.relative_step);
        // Shape errors surface here, before any iteration
        problem.predict(guess)?;

        let solution = problem.solve(guess.clone(), options)?;
        let (params, sse) = (solution.params, solution.sse);

        let residuals = problem.residuals(&params)?;
        let jacobian = problem.model_jacobian(&params)?;
        let normal_inverse = inverse_normal_matrix(&jacobian, options.rank_rtol)?;
        if !normal_inverse.is_full_rank() {
            return Err(FitError::SingularJacobian {
                params,
                rank: normal_inverse.rank,
                parameters: p,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let residual_variance = sse / degrees_of_freedom as f64;
        let covariance = normal_inverse.inverse * residual_variance;
        let standard_errors = covariance.diag().mapv(f64::sqrt);
        let intervals = intervals(&params, &standard_errors, t_value);

        let mean = y.mean().unwrap_or_default();
        let total_sum_of_squares = y.iter().map(|y| (y - mean).powi(2)).sum();

        Ok(FitResult {
            params,
            standard_errors,
            intervals,
            alpha: options.alpha,
            t_value,
            covariance,
            residuals,
            sse,
            total_sum_of_squares,
            degrees_of_freedom,
            iterations: solution.iterations,
            relative_step: options.relative_step,
        })
    }

    /// Fit `model` to an [`ObservationSet`]
    ///
    /// # Errors
    /// As for [`NonlinearFitter::fit`].
    pub fn fit_observations<M, X>(
        &self,
        model: &M,
        observations: &ObservationSet<X>,
        guess: &Array1<f64>,
    ) -> Result<FitResult, FitError>
    where
        M: Model<X>,
    {
        self.fit(model, observations.x(), observations.y(), guess)
    }
}

/// Fit `model` to `y` observed at `x` from `guess`, reporting $(1 - \alpha)$ confidence intervals
///
/// Uses the default [`FitOptions`]. See [`NonlinearFitter::fit`] for the failure modes.
///
/// # Errors
/// As for [`NonlinearFitter::fit`].
///
/// # Examples
///
/// ```
/// use ndarray::{arr1, Array1};
/// use nlinfit::{fit, ModelError};
///
/// let model = |x: &[f64], p: &Array1<f64>| -> Result<Array1<f64>, ModelError> {
///     Ok(x.iter().map(|x| p[0] * x.powf(p[1])).collect())
/// };
/// let x = [1., 2., 4., 8.];
/// let y = arr1(&[2.1, 5.5, 16.3, 45.0]);
///
/// let result = fit(&model, &x, &y, &arr1(&[1.5, 1.0]), 0.05).unwrap();
/// let (lower, upper) = result.intervals()[1];
/// assert!(lower < result.params()[1] && result.params()[1] < upper);
/// ```
pub fn fit<M, X>(
    model: &M,
    x: &[X],
    y: &Array1<f64>,
    guess: &Array1<f64>,
    alpha: f64,
) -> Result<FitResult, FitError>
where
    M: Model<X>,
{
    NonlinearFitter::new(FitOptions::default().with_alpha(alpha)).fit(model, x, y, guess)
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, Array1};

    use super::{fit, NonlinearFitter};
    use crate::config::FitOptions;
    use crate::error::FitError;
    use crate::model::ModelError;

    fn proportional(x: &[f64], params: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(x.iter().map(|x| params[0] * x).collect())
    }

    fn power_law(x: &[f64], params: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(x.iter().map(|x| params[0] * x.powf(params[1])).collect())
    }

    #[test]
    fn noise_free_linear_data_give_point_intervals() {
        let k0 = 3.7;
        let x: Vec<f64> = (1..=8).map(f64::from).collect();
        let y: Array1<f64> = x.iter().map(|x| k0 * x).collect();

        let result = fit(&proportional, &x, &y, &arr1(&[1.]), 0.05).unwrap();

        approx::assert_relative_eq!(result.params()[0], k0, max_relative = 1e-12);
        let (lower, upper) = result.intervals()[0];
        assert!(upper - lower < 1e-10);
        assert!(result.standard_errors()[0] >= 0.);
    }

    #[test]
    fn power_law_parameters_are_recovered() {
        let (k0, alpha0) = (2., 1.5);
        let x = [1., 2., 4.];
        let y: Array1<f64> = x.iter().map(|x: &f64| k0 * x.powf(alpha0)).collect();

        let result = fit(&power_law, &x, &y, &arr1(&[1.5, 1.0]), 0.05).unwrap();

        approx::assert_relative_eq!(result.params()[0], k0, max_relative = 1e-9);
        approx::assert_relative_eq!(result.params()[1], alpha0, max_relative = 1e-9);
        assert_eq!(result.degrees_of_freedom(), 1);
    }

    #[test]
    fn zero_degrees_of_freedom_is_an_error() {
        let x = [1., 2.];
        let y = arr1(&[2., 5.6]);

        let result = fit(&power_law, &x, &y, &arr1(&[1.5, 1.0]), 0.05);

        assert!(matches!(
            result,
            Err(FitError::InsufficientDegreesOfFreedom {
                observations: 2,
                parameters: 2
            })
        ));
    }

    #[test]
    fn mismatched_samples_are_rejected_before_fitting() {
        let x = [1., 2., 3., 4.];
        let y = arr1(&[1., 2., 3.]);

        assert!(matches!(
            fit(&proportional, &x, &y, &arr1(&[1.]), 0.05),
            Err(FitError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn model_output_of_the_wrong_length_is_rejected() {
        let x = [1., 2., 3., 4.];
        let y = arr1(&[1., 2., 3., 4.]);
        let doubled = |x: &[f64], params: &Array1<f64>| -> Result<Array1<f64>, ModelError> {
            Ok(x.iter().chain(x.iter()).map(|x| params[0] * x).collect())
        };

        assert!(matches!(
            fit(&doubled, &x, &y, &arr1(&[1.]), 0.05),
            Err(FitError::DimensionMismatch {
                expected: 4,
                found: 8
            })
        ));
    }

    #[test]
    fn an_empty_guess_is_rejected() {
        let x = [1., 2.];
        let y = arr1(&[1., 2.]);
        assert!(matches!(
            fit(&proportional, &x, &y, &Array1::zeros(0), 0.05),
            Err(FitError::EmptyGuess)
        ));
    }

    #[test]
    fn significance_must_lie_in_the_unit_interval() {
        let x = [1., 2., 3.];
        let y = arr1(&[1., 2., 3.]);
        assert!(matches!(
            fit(&proportional, &x, &y, &arr1(&[1.]), 1.2),
            Err(FitError::InvalidSignificance(_))
        ));
    }

    #[test]
    fn unidentifiable_parameters_are_reported_as_singular() {
        // Only the product of the two parameters is constrained by the data
        let product = |x: &[f64], params: &Array1<f64>| -> Result<Array1<f64>, ModelError> {
            Ok(x.iter().map(|x| params[0] * params[1] * x).collect())
        };
        let x: Vec<f64> = (1..=6).map(f64::from).collect();
        let y: Array1<f64> = x.iter().map(|x| 6. * x + 0.01 * x.sin()).collect();

        match fit(&product, &x, &y, &arr1(&[1., 2.]), 0.05) {
            Err(FitError::SingularJacobian {
                params,
                rank,
                parameters,
            }) => {
                assert_eq!(rank, 1);
                assert_eq!(parameters, 2);
                approx::assert_relative_eq!(params[0] * params[1], 6., max_relative = 1e-2);
            }
            other => panic!("expected a singular jacobian, got {other:?}"),
        }
    }

    #[test]
    fn parameters_the_model_ignores_are_reported_as_singular() {
        let ignores_offset = |x: &[f64], params: &Array1<f64>| -> Result<Array1<f64>, ModelError> {
            Ok(x.iter().map(|x| params[0] * x).collect())
        };
        let x = [1., 2., 3., 4.];
        let y = arr1(&[1.1, 1.9, 3.2, 3.9]);

        assert!(matches!(
            fit(&ignores_offset, &x, &y, &arr1(&[1., 0.]), 0.05),
            Err(FitError::SingularJacobian { rank: 1, .. })
        ));
    }

    #[test]
    fn repeated_fits_are_identical() {
        let x = [0.5, 1., 2., 3., 5.];
        let y = arr1(&[0.9, 2.1, 5.4, 10.7, 22.0]);

        let fitter = NonlinearFitter::new(FitOptions::default());
        let first = fitter.fit(&power_law, &x, &y, &arr1(&[1., 1.])).unwrap();
        let second = fitter.fit(&power_law, &x, &y, &arr1(&[1., 1.])).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn intervals_at_the_fit_significance_match_the_reported_intervals() {
        let x = [0.5, 1., 2., 3., 5.];
        let y = arr1(&[0.9, 2.1, 5.4, 10.7, 22.0]);

        let result = fit(&power_law, &x, &y, &arr1(&[1., 1.]), 0.05).unwrap();
        let recomputed = result.intervals_at(0.05).unwrap();

        for (reported, recomputed) in result.intervals().iter().zip(recomputed.iter()) {
            approx::assert_relative_eq!(reported.0, recomputed.0);
            approx::assert_relative_eq!(reported.1, recomputed.1);
        }
    }

    #[test]
    fn summary_statistics_are_consistent() {
        let x = [0.5, 1., 2., 3., 5.];
        let y = arr1(&[0.9, 2.1, 5.4, 10.7, 22.0]);

        let result = fit(&power_law, &x, &y, &arr1(&[1., 1.]), 0.05).unwrap();

        approx::assert_relative_eq!(
            result.sse(),
            result.residuals().dot(result.residuals()),
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(result.residual_variance(), result.sse() / 3.);
        for (ii, se) in result.standard_errors().iter().enumerate() {
            approx::assert_relative_eq!(
                se.powi(2),
                result.covariance()[[ii, ii]],
                max_relative = 1e-12
            );
        }
        let correlation = result.correlation().unwrap();
        approx::assert_relative_eq!(correlation[[0, 0]], 1., max_relative = 1e-12);
        approx::assert_relative_eq!(correlation[[0, 1]], correlation[[1, 0]]);
        assert!(correlation[[0, 1]].abs() <= 1.);
        assert!(result.r_squared().unwrap() > 0.99);
    }
}
