use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{
    Error, Executor, IterState, Jacobian, Operator, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Norm, Solve};
use serde::{Deserialize, Serialize};

use crate::config::FitOptions;
use crate::error::FitError;
use crate::math::finite_difference_step;
use crate::model::Model;

/// Smallest damping the solver will decay to after a run of accepted steps
const MIN_LAMBDA: f64 = 1e-12;

/// A least-squares problem: a model, the samples it is evaluated at and the observations it
/// must reproduce.
///
/// The residual vector is $r(\theta) = f(x, \theta) - y$, and its Jacobian is that of the model
/// as $y$ does not depend on $\theta$.
pub(crate) struct FitProblem<'a, M, X> {
    model: &'a M,
    x: &'a [X],
    y: &'a Array1<f64>,
    /// Relative step for central differences
    relative_step: f64,
}

impl<M, X> Clone for FitProblem<'_, M, X> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, X> Copy for FitProblem<'_, M, X> {}

impl<'a, M: Model<X>, X> FitProblem<'a, M, X> {
    pub(crate) const fn new(
        model: &'a M,
        x: &'a [X],
        y: &'a Array1<f64>,
        relative_step: f64,
    ) -> Self {
        Self {
            model,
            x,
            y,
            relative_step,
        }
    }

    /// Evaluate the model, checking it returned one finite prediction per observation
    pub(crate) fn predict(&self, params: &Array1<f64>) -> Result<Array1<f64>, FitError> {
        let predicted = self
            .model
            .evaluate(self.x, params)
            .map_err(FitError::Model)?;

        if predicted.len() != self.y.len() {
            return Err(FitError::DimensionMismatch {
                expected: self.y.len(),
                found: predicted.len(),
            });
        }
        if let Some(index) = predicted.iter().position(|value| !value.is_finite()) {
            return Err(FitError::NonFinite { index });
        }

        Ok(predicted)
    }

    pub(crate) fn residuals(&self, params: &Array1<f64>) -> Result<Array1<f64>, FitError> {
        Ok(self.predict(params)? - self.y)
    }

    /// Central-difference Jacobian of the model with respect to the parameters
    ///
    /// Row `i` holds the derivatives of the prediction for sample `i`, so the matrix has
    /// dimension (num observations x num parameters). Each column costs two model evaluations.
    pub(crate) fn model_jacobian(&self, params: &Array1<f64>) -> Result<Array2<f64>, FitError> {
        let mut jacobian = Array2::zeros((self.y.len(), params.len()));
        for jj in 0..params.len() {
            let delta = finite_difference_step(params[jj], self.relative_step);

            let mut params_plus = params.clone();
            params_plus[jj] += delta;
            let mut params_minus = params.clone();
            params_minus[jj] -= delta;

            let column = (self.predict(&params_plus)? - self.predict(&params_minus)?) / (2. * delta);
            jacobian.column_mut(jj).assign(&column);
        }
        Ok(jacobian)
    }

    /// Run the Levenberg-Marquardt minimisation from `guess`
    ///
    /// # Errors
    /// Fails with [`FitError::NotConverged`] if the iteration budget in `options` is
    /// exhausted, and with the model's own failure if any trial evaluation fails.
    pub(crate) fn solve(
        &self,
        guess: Array1<f64>,
        options: &FitOptions,
    ) -> Result<Solution, FitError> {
        let solver = LevenbergMarquardt::new(options);

        let mut executor = Executor::new(*self, solver)
            .configure(|state| state.param(guess).max_iters(options.max_iters));
        if options.log_iterations {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }

        let res = executor.run().map_err(FitError::from_argmin)?;

        let state = res.state();
        let params = state
            .get_param()
            .cloned()
            .ok_or_else(|| FitError::Solver("solver finished without a parameter vector".into()))?;
        let sse = state.get_cost();
        let iterations = state.get_iter();

        match state.get_termination_status() {
            TerminationStatus::Terminated(TerminationReason::SolverConverged) => Ok(Solution {
                params,
                sse,
                iterations,
            }),
            TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
                Err(FitError::NotConverged {
                    iterations,
                    params,
                    residual_norm: sse.sqrt(),
                })
            }
            status => Err(FitError::Solver(format!("{status:?}"))),
        }
    }
}

impl<M: Model<X>, X> Operator for FitProblem<'_, M, X> {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, Error> {
        self.residuals(p).map_err(Error::new)
    }
}

impl<M: Model<X>, X> Jacobian for FitProblem<'_, M, X> {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(&self, p: &Self::Param) -> ::std::result::Result<Self::Jacobian, Error> {
        self.model_jacobian(p).map_err(Error::new)
    }
}

/// Outcome of a converged minimisation
#[derive(Clone, Debug)]
pub(crate) struct Solution {
    pub(crate) params: Array1<f64>,
    /// Sum of squared residuals at `params`
    pub(crate) sse: f64,
    pub(crate) iterations: u64,
}

type LmState = IterState<Array1<f64>, (), (), (), f64>;

/// Levenberg-Marquardt with Marquardt's diagonal scaling
///
/// Every iteration solves the damped normal equations
/// $$
///     \left(J^T J + \lambda \operatorname{diag}(J^T J)\right) \delta = -J^T r
/// $$
/// and accepts the step only if it lowers the sum of squares, decreasing $\lambda$ towards
/// Gauss-Newton. Rejected steps raise $\lambda$ towards steepest descent and are retried
/// within the same iteration. The cost carried in the state is the sum of squared residuals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LevenbergMarquardt {
    lambda: f64,
    lambda_factor: f64,
    max_lambda: f64,
    ftol: f64,
    xtol: f64,
    gtol: f64,
    converged: bool,
}

impl LevenbergMarquardt {
    pub fn new(options: &FitOptions) -> Self {
        Self {
            lambda: options.initial_lambda,
            lambda_factor: options.lambda_factor,
            max_lambda: options.max_lambda,
            ftol: options.ftol,
            xtol: options.xtol,
            gtol: options.gtol,
            converged: false,
        }
    }

    /// Largest cosine between the residual vector and a column of the Jacobian
    ///
    /// NaN in any column propagates to the result, so it can never pass for convergence.
    fn scaled_gradient_norm(normal: &Array2<f64>, gradient: &Array1<f64>, cost: f64) -> f64 {
        let residual_norm = cost.sqrt();
        normal
            .diag()
            .iter()
            .zip(gradient.iter())
            .filter(|(column_norm_squared, _)| !(**column_norm_squared <= 0.))
            .map(|(column_norm_squared, g)| g.abs() / (column_norm_squared.sqrt() * residual_norm))
            .fold(0., |largest: f64, cosine| {
                if cosine.is_nan() || cosine > largest {
                    cosine
                } else {
                    largest
                }
            })
    }
}

impl<O> Solver<O, LmState> for LevenbergMarquardt
where
    O: Operator<Param = Array1<f64>, Output = Array1<f64>>
        + Jacobian<Param = Array1<f64>, Jacobian = Array2<f64>>,
{
    const NAME: &'static str = "Levenberg-Marquardt";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        state: LmState,
    ) -> ::std::result::Result<(LmState, Option<KV>), Error> {
        let param = state
            .get_param()
            .cloned()
            .ok_or_else(|| Error::msg("Levenberg-Marquardt requires an initial parameter vector"))?;
        let residuals = problem.apply(&param)?;
        let cost = residuals.dot(&residuals);
        if !cost.is_finite() {
            return Err(Error::msg(
                "sum of squares is not finite at the initial parameters",
            ));
        }
        Ok((state.param(param).cost(cost), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        mut state: LmState,
    ) -> ::std::result::Result<(LmState, Option<KV>), Error> {
        let param = state
            .take_param()
            .ok_or_else(|| Error::msg("Levenberg-Marquardt state lost its parameter vector"))?;

        let residuals = problem.apply(&param)?;
        let cost = residuals.dot(&residuals);
        let jacobian = problem.jacobian(&param)?;
        let normal = jacobian.t().dot(&jacobian);
        let gradient = jacobian.t().dot(&residuals);

        if cost == 0. {
            self.converged = true;
            return Ok((state.param(param).cost(cost), None));
        }
        let gradient_norm = Self::scaled_gradient_norm(&normal, &gradient, cost);
        if gradient_norm.is_nan() {
            return Err(Error::msg("gradient of the sum of squares is not finite"));
        }
        if gradient_norm <= self.gtol {
            self.converged = true;
            return Ok((state.param(param).cost(cost), None));
        }

        // Columns with no sensitivity still need a positive scale for the damped system to be
        // solvable
        let scale = normal.diag().to_owned();
        let floor = (f64::EPSILON * scale.iter().copied().fold(0., f64::max)).max(f64::MIN_POSITIVE);
        let scale = scale.mapv(|d| d.max(floor));
        let descent = gradient.mapv(|g| -g);

        loop {
            let mut damped = normal.clone();
            damped.diag_mut().scaled_add(self.lambda, &scale);

            if let Ok(step) = damped.solve(&descent) {
                let trial = &param + &step;
                let trial_residuals = problem.apply(&trial)?;
                let trial_cost = trial_residuals.dot(&trial_residuals);

                if trial_cost < cost {
                    self.lambda = (self.lambda / self.lambda_factor).max(MIN_LAMBDA);
                    self.converged = cost - trial_cost <= self.ftol * cost
                        || step.norm_l2() <= self.xtol * (param.norm_l2() + self.xtol);
                    return Ok((state.param(trial).cost(trial_cost), None));
                }
            }

            self.lambda *= self.lambda_factor;
            if self.lambda > self.max_lambda {
                // No step along any damped direction lowers the cost, we are at a minimum to
                // within machine precision
                self.converged = true;
                return Ok((state.param(param).cost(cost), None));
            }
        }
    }

    fn terminate(&mut self, _state: &LmState) -> TerminationStatus {
        if self.converged {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        } else {
            TerminationStatus::NotTerminated
        }
    }
}
