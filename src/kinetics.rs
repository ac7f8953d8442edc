//! Reactor models defined by ordinary differential equations
//!
//! States are advanced with the classic fixed-step fourth order Runge-Kutta scheme. Within each
//! interval between samples the step is `max_step`, except for the last one, which is shortened
//! so the solution lands exactly on the sample time.
use itertools::Itertools;
use ndarray::{arr1, Array1};

use crate::error::FitError;
use crate::model::{Model, ModelError};

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("sample times must be finite and non-decreasing, violated at sample {index}")]
    InvalidTimes { index: usize },
    #[error("maximum step must be positive and finite, found {0}")]
    InvalidStep(f64),
    #[error("state became non-finite at t = {time}")]
    NonFiniteState { time: f64 },
}

/// Integrate `dy/dt = rhs(t, y)` and return the state at each of `times`
///
/// `y0` is the state at `times[0]`, and is returned as the first entry.
///
/// # Errors
/// Fails if `times` is not finite and non-decreasing, if `max_step` is not a positive finite
/// number, or if the state becomes non-finite.
pub fn rk4<F>(
    rhs: F,
    y0: &Array1<f64>,
    times: &[f64],
    max_step: f64,
) -> Result<Vec<Array1<f64>>, IntegrationError>
where
    F: Fn(f64, &Array1<f64>) -> Array1<f64>,
{
    if !(max_step.is_finite() && max_step > 0.) {
        return Err(IntegrationError::InvalidStep(max_step));
    }
    if let Some(index) = times.iter().position(|t| !t.is_finite()) {
        return Err(IntegrationError::InvalidTimes { index });
    }
    if let Some(index) = times
        .iter()
        .tuple_windows()
        .position(|(earlier, later)| later < earlier)
    {
        return Err(IntegrationError::InvalidTimes { index: index + 1 });
    }

    let Some((&t0, rest)) = times.split_first() else {
        return Ok(Vec::new());
    };

    let mut states = Vec::with_capacity(times.len());
    let mut t = t0;
    let mut y = y0.clone();
    states.push(y.clone());

    for &target in rest {
        while t < target {
            let last = target - t <= max_step;
            let h = if last { target - t } else { max_step };

            let k1 = rhs(t, &y);
            let k2 = rhs(t + 0.5 * h, &(&y + &(&k1 * (0.5 * h))));
            let k3 = rhs(t + 0.5 * h, &(&y + &(&k2 * (0.5 * h))));
            let k4 = rhs(t + h, &(&y + &(&k3 * h)));
            y = &y + &((k1 + k2 * 2. + k3 * 2. + k4) * (h / 6.));
            t = if last { target } else { t + h };

            if y.iter().any(|value| !value.is_finite()) {
                return Err(IntegrationError::NonFiniteState { time: t });
            }
        }
        states.push(y.clone());
    }

    Ok(states)
}

/// Concentration in a batch reactor with the rate law $dC/dt = -k C^\alpha$
///
/// The parameters are `[k, alpha]`, and the samples are times measured from the moment the
/// concentration equals `initial_concentration`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PowerLawDecay {
    pub initial_concentration: f64,
    pub max_step: f64,
}

impl PowerLawDecay {
    pub const fn new(initial_concentration: f64, max_step: f64) -> Self {
        Self {
            initial_concentration,
            max_step,
        }
    }
}

impl Model<f64> for PowerLawDecay {
    fn evaluate(&self, x: &[f64], params: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        if params.len() != 2 {
            return Err(FitError::DimensionMismatch {
                expected: 2,
                found: params.len(),
            }
            .into());
        }
        let (k, order) = (params[0], params[1]);

        let times: Vec<f64> = std::iter::once(0.).chain(x.iter().copied()).collect();
        let states = rk4(
            |_, c| c.mapv(|c| -k * c.powf(order)),
            &arr1(&[self.initial_concentration]),
            &times,
            self.max_step,
        )?;

        Ok(states.iter().skip(1).map(|c| c[0]).collect())
    }
}
