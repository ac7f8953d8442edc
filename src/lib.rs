#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub(crate) mod config;
pub(crate) mod distributions;
pub(crate) mod error;
pub(crate) mod fit;
pub mod kinetics;
pub mod math;
pub(crate) mod minimisation;
pub(crate) mod model;
pub(crate) mod observations;
pub mod propagation;

pub use config::FitOptions;
pub use distributions::t_critical;
pub use error::FitError;
pub use fit::{fit, FitResult, NonlinearFitter};
pub use kinetics::{rk4, IntegrationError, PowerLawDecay};
pub use minimisation::LevenbergMarquardt;
pub use model::{Model, ModelError};
pub use observations::ObservationSet;
pub use propagation::{prediction_band, propagate, Estimate};

pub type Result<T> = ::std::result::Result<T, Box<dyn ::std::error::Error>>;
