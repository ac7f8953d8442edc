use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::FitError;
use crate::Result;

const NON_NEGATIVE: &str = "finite and non-negative";
const POSITIVE: &str = "finite and positive";

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.
}

/// Settings controlling the minimiser and the statistics reported for a fit.
///
/// All fields have defaults, so a configuration file need only list the values it changes.
///
/// ```
/// use nlinfit::FitOptions;
///
/// let options = FitOptions::from_toml_str("max_iters = 50\nalpha = 0.1").unwrap();
/// assert_eq!(options.max_iters, 50);
/// assert_eq!(options.ftol, FitOptions::default().ftol);
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FitOptions {
    /// Iteration budget. Exhausting it is reported as a convergence failure.
    pub max_iters: u64,
    /// Converged when an accepted step reduces the sum of squares by less than this fraction
    pub ftol: f64,
    /// Converged when an accepted step is smaller than this fraction of the parameter norm
    pub xtol: f64,
    /// Converged when the cosine between residuals and every Jacobian column falls below this
    pub gtol: f64,
    /// Starting Levenberg-Marquardt damping
    pub initial_lambda: f64,
    /// Factor by which the damping is raised after a rejected step and lowered after an
    /// accepted one
    pub lambda_factor: f64,
    /// Damping above which no descent step is deemed to exist
    pub max_lambda: f64,
    /// Relative step for the central-difference Jacobian
    pub relative_step: f64,
    /// Singular values of the Jacobian smaller than this fraction of the largest one are
    /// treated as zero when checking the parameters are identifiable
    pub rank_rtol: f64,
    /// Significance level used when the caller does not supply one
    pub alpha: f64,
    /// Log every solver iteration to the terminal
    pub log_iterations: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            initial_lambda: 1e-3,
            lambda_factor: 10.,
            max_lambda: 1e16,
            relative_step: f64::EPSILON.cbrt(),
            rank_rtol: f64::EPSILON.sqrt(),
            alpha: 0.05,
            log_iterations: false,
        }
    }
}

impl FitOptions {
    /// Parse options from a TOML document
    ///
    /// # Errors
    /// Returns an error if the document is malformed, names an unknown option, or sets an
    /// option outside its valid range.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: Self = toml::from_str(contents)?;
        options.validate()?;
        Ok(options)
    }

    /// Check every option lies in the range for which the minimiser terminates
    ///
    /// The damping must start positive and grow by a factor above one towards a finite
    /// ceiling, otherwise a run of rejected steps never ends.
    ///
    /// # Errors
    /// Returns [`FitError::InvalidOption`] naming the first offending option, or
    /// [`FitError::InvalidSignificance`] for an `alpha` outside (0, 1).
    pub fn validate(&self) -> ::std::result::Result<(), FitError> {
        let checks = [
            ("ftol", self.ftol, is_non_negative(self.ftol), NON_NEGATIVE),
            ("xtol", self.xtol, is_non_negative(self.xtol), NON_NEGATIVE),
            ("gtol", self.gtol, is_non_negative(self.gtol), NON_NEGATIVE),
            ("rank_rtol", self.rank_rtol, is_non_negative(self.rank_rtol), NON_NEGATIVE),
            ("relative_step", self.relative_step, is_positive(self.relative_step), POSITIVE),
            ("initial_lambda", self.initial_lambda, is_positive(self.initial_lambda), POSITIVE),
            (
                "lambda_factor",
                self.lambda_factor,
                self.lambda_factor.is_finite() && self.lambda_factor > 1.,
                "finite and greater than one",
            ),
            (
                "max_lambda",
                self.max_lambda,
                self.max_lambda.is_finite() && self.max_lambda > self.initial_lambda,
                "finite and greater than initial_lambda",
            ),
        ];

        if let Some(&(name, value, _, requirement)) = checks.iter().find(|check| !check.2) {
            return Err(FitError::InvalidOption {
                name,
                value,
                requirement,
            });
        }
        if !(self.alpha > 0. && self.alpha < 1.) {
            return Err(FitError::InvalidSignificance(self.alpha));
        }
        Ok(())
    }

    /// Read options from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err("requested file not found".into());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub const fn with_max_iters(mut self, max_iters: u64) -> Self {
        self.max_iters = max_iters;
        self
    }

    #[must_use]
    pub const fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    #[must_use]
    pub const fn with_relative_step(mut self, relative_step: f64) -> Self {
        self.relative_step = relative_step;
        self
    }

    #[must_use]
    pub const fn with_iteration_logging(mut self, log_iterations: bool) -> Self {
        self.log_iterations = log_iterations;
        self
    }
}
