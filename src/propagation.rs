use ndarray::Array1;

use crate::error::FitError;
use crate::fit::FitResult;
use crate::math::finite_difference_step;
use crate::minimisation::FitProblem;
use crate::model::{Model, ModelError};

/// A quantity derived from fitted parameters, with its first-order standard error
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimate {
    pub value: f64,
    pub standard_error: f64,
}

impl Estimate {
    /// Symmetric interval `value ± t_value * standard_error`
    ///
    /// Pass [`FitResult::t_value`] for an interval at the significance of the fit.
    pub fn interval(&self, t_value: f64) -> (f64, f64) {
        (
            self.value - t_value * self.standard_error,
            self.value + t_value * self.standard_error,
        )
    }
}

/// Propagate the parameter covariance of a fit through a scalar function of the parameters
///
/// Uses the first-order (delta method) approximation
/// $$
///     \sigma_f^2 = \nabla f^T \Sigma \nabla f,
/// $$
/// with the gradient taken by central differences at the fitted parameters, using the relative
/// step the fit's Jacobian was taken with. The approximation is good while $f$ is close to
/// linear over the confidence region of the parameters.
///
/// # Errors
/// Returns [`FitError::Model`] if `f` fails, or [`FitError::NonFinite`] if it returns a
/// non-finite value at any of the evaluation points.
pub fn propagate<F>(result: &FitResult, f: F) -> Result<Estimate, FitError>
where
    F: Fn(&Array1<f64>) -> Result<f64, ModelError>,
{
    let relative_step = result.relative_step();
    let params = result.params();
    let evaluate = |params: &Array1<f64>| -> Result<f64, FitError> {
        let value = f(params).map_err(FitError::Model)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FitError::NonFinite { index: 0 })
        }
    };

    let value = evaluate(params)?;

    let mut gradient = Array1::zeros(params.len());
    for jj in 0..params.len() {
        let delta = finite_difference_step(params[jj], relative_step);
        let mut params_plus = params.clone();
        params_plus[jj] += delta;
        let mut params_minus = params.clone();
        params_minus[jj] -= delta;
        gradient[jj] = (evaluate(&params_plus)? - evaluate(&params_minus)?) / (2. * delta);
    }

    let variance = gradient.dot(&result.covariance().dot(&gradient));

    Ok(Estimate {
        value,
        // Σ is positive semi-definite, a negative variance can only be rounding
        standard_error: variance.max(0.).sqrt(),
    })
}

/// Model predictions at new samples with their first-order standard errors
///
/// The standard error of the prediction at $x_i$ is $\sqrt{g_i^T \Sigma g_i}$, where $g_i$ is the
/// gradient of the model prediction with respect to the parameters. This is the uncertainty of
/// the mean response, it does not include the scatter of new observations about the model.
///
/// # Errors
/// Returns the model's failure, or [`FitError::DimensionMismatch`] if the model does not
/// return one prediction per sample.
pub fn prediction_band<M, X>(
    result: &FitResult,
    model: &M,
    x: &[X],
) -> Result<Vec<Estimate>, FitError>
where
    M: Model<X>,
{
    let placeholder = Array1::zeros(x.len());
    let problem = FitProblem::new(model, x, &placeholder, result.relative_step());

    let predicted = problem.predict(result.params())?;
    let jacobian = problem.model_jacobian(result.params())?;
    let covariance = result.covariance();

    Ok(predicted
        .iter()
        .zip(jacobian.rows())
        .map(|(&value, gradient)| {
            let variance = gradient.dot(&covariance.dot(&gradient));
            Estimate {
                value,
                standard_error: variance.max(0.).sqrt(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, Array1};

    use super::{prediction_band, propagate, Estimate};
    use crate::config::FitOptions;
    use crate::fit::{fit, NonlinearFitter};
    use crate::model::ModelError;
    use crate::FitError;

    fn line(x: &[f64], params: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        Ok(x.iter().map(|x| params[0] + params[1] * x).collect())
    }

    fn noisy_line() -> (Vec<f64>, Array1<f64>) {
        let x: Vec<f64> = (0..10).map(f64::from).collect();
        let noise = [0.1, -0.2, 0.05, 0.15, -0.1, 0.0, 0.2, -0.15, 0.1, -0.05];
        let y = x
            .iter()
            .zip(noise)
            .map(|(x, e)| 1.5 + 0.8 * x + e)
            .collect();
        (x, y)
    }

    #[test]
    fn linear_combinations_match_the_exact_variance() {
        let (x, y) = noisy_line();
        let result = fit(&line, &x, &y, &arr1(&[0., 1.]), 0.05).unwrap();

        let estimate = propagate(&result, |p| Ok(2. * p[0] - 3. * p[1])).unwrap();

        let a = arr1(&[2., -3.]);
        let expected_variance = a.dot(&result.covariance().dot(&a));
        approx::assert_relative_eq!(
            estimate.value,
            2. * result.params()[0] - 3. * result.params()[1],
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(
            estimate.standard_error,
            expected_variance.sqrt(),
            max_relative = 1e-6
        );
    }

    #[test]
    fn propagating_a_single_parameter_returns_its_standard_error() {
        let (x, y) = noisy_line();
        let result = fit(&line, &x, &y, &arr1(&[0., 1.]), 0.05).unwrap();

        let slope = propagate(&result, |p| Ok(p[1])).unwrap();

        approx::assert_relative_eq!(
            slope.standard_error,
            result.standard_errors()[1],
            max_relative = 1e-6
        );
        let (lower, upper) = slope.interval(result.t_value());
        approx::assert_relative_eq!(lower, result.intervals()[1].0, max_relative = 1e-6);
        approx::assert_relative_eq!(upper, result.intervals()[1].1, max_relative = 1e-6);
    }

    #[test]
    fn failures_in_the_derived_quantity_propagate() {
        let (x, y) = noisy_line();
        let result = fit(&line, &x, &y, &arr1(&[0., 1.]), 0.05).unwrap();

        let error = propagate(&result, |_| Err("undefined".into())).unwrap_err();
        assert!(matches!(error, FitError::Model(_)));

        let error = propagate(&result, |p| Ok(1. / (p[0] - p[0]))).unwrap_err();
        assert!(matches!(error, FitError::NonFinite { .. }));
    }

    #[test]
    fn prediction_band_is_narrowest_near_the_centre_of_the_data() {
        let (x, y) = noisy_line();
        let result = fit(&line, &x, &y, &arr1(&[0., 1.]), 0.05).unwrap();

        let band = prediction_band(&result, &line, &[-10., 4.5, 20.]).unwrap();

        assert_eq!(band.len(), 3);
        assert!(band[1].standard_error < band[0].standard_error);
        assert!(band[1].standard_error < band[2].standard_error);
        approx::assert_relative_eq!(
            band[1].value,
            result.params()[0] + 4.5 * result.params()[1],
            max_relative = 1e-12
        );
    }

    #[test]
    fn prediction_band_at_the_samples_reproduces_the_fitted_values() {
        let (x, y) = noisy_line();
        let result = fit(&line, &x, &y, &arr1(&[0., 1.]), 0.05).unwrap();

        let band = prediction_band(&result, &line, &x).unwrap();

        for ((Estimate { value, .. }, observed), residual) in
            band.iter().zip(y.iter()).zip(result.residuals().iter())
        {
            approx::assert_relative_eq!(*value, observed + residual, max_relative = 1e-10);
        }
    }

    #[test]
    fn derivatives_use_the_step_the_fit_was_taken_with() {
        let (x, y) = noisy_line();
        let relative_step = 0.1;
        let fitter = NonlinearFitter::new(FitOptions::default().with_relative_step(relative_step));
        let result = fitter.fit(&line, &x, &y, &arr1(&[0., 1.])).unwrap();
        assert_eq!(result.relative_step(), relative_step);

        let cubed = propagate(&result, |p| Ok(p[0].powi(3))).unwrap();

        // A central difference of a cubic overshoots the derivative by exactly h^2
        let intercept = result.params()[0];
        let h = relative_step * intercept.abs().max(1.);
        let expected = (3. * intercept.powi(2) + h * h).abs() * result.standard_errors()[0];
        approx::assert_relative_eq!(cubed.standard_error, expected, max_relative = 1e-9);
    }
}
