use std::fs;
use std::path::Path;

use ndarray::Array1;
use serde::Deserialize;

use crate::error::FitError;
use crate::Result;

/// An ordered set of observations
///
/// Each observation pairs an independent-variable sample with a scalar dependent value. The
/// independent samples need not be evenly spaced and may themselves be vectors.
#[derive(Clone, Debug)]
pub struct ObservationSet<X> {
    x: Vec<X>,
    y: Array1<f64>,
}

impl<X> ObservationSet<X> {
    /// # Errors
    /// Returns [`FitError::DimensionMismatch`] if `x` and `y` differ in length.
    pub fn new(x: Vec<X>, y: Array1<f64>) -> ::std::result::Result<Self, FitError> {
        if x.len() != y.len() {
            return Err(FitError::DimensionMismatch {
                expected: x.len(),
                found: y.len(),
            });
        }
        Ok(Self { x, y })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (X, f64)>) -> Self {
        let (x, y): (Vec<X>, Vec<f64>) = pairs.into_iter().unzip();
        Self {
            x,
            y: Array1::from(y),
        }
    }

    pub fn x(&self) -> &[X] {
        &self.x
    }

    pub const fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

#[derive(Deserialize)]
struct Row(f64, f64);

impl ObservationSet<f64> {
    /// Read a two column CSV file with a header row
    ///
    /// The first column holds the independent variable and the second the observed value.
    ///
    /// # Errors
    /// Returns an error if the file is missing, or a row cannot be parsed as two numbers.
    pub fn from_csv(filepath: &Path) -> Result<Self> {
        if !filepath.exists() {
            return Err("requested file not found".into());
        }

        let file = fs::read(filepath)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(&file[..]);

        let mut x = vec![];
        let mut y = vec![];

        for result in rdr.deserialize() {
            let record: Row = result?;
            x.push(record.0);
            y.push(record.1);
        }

        Ok(Self {
            x,
            y: Array1::from(y),
        })
    }
}
