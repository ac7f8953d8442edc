use ndarray::{Array1, Array2, LinalgScalar};
use ndarray_linalg::SVD;
use num_traits::Float;

use crate::error::FitError;
use crate::Result;

/// Compute the outer product of two one-dimensional vectors of length (m x 1) and (n x 1)
///
/// The outer product is the (m x n) matrix whose elements are products of elements in the first
/// vector with those in the second.
///
/// # Examples
///
/// ```
/// use nlinfit::math::outer_product;
/// use ndarray::{arr1, arr2, Array1};
///
/// let u: Array1<f64> = arr1(&[1., 2., 3.]);
/// let v = arr1(&[4., 5., 6.]);
/// let outer_product = outer_product(&u, &v).unwrap();
///
/// let expected = arr2(&[[4., 5., 6.], [8., 10., 12.], [12., 15., 18.]]);
/// assert_eq!(outer_product, expected);
///```
pub fn outer_product<T: LinalgScalar>(u: &Array1<T>, v: &Array1<T>) -> Result<Array2<T>> {
    let u: Array2<T> = u.clone().into_shape((u.len(), 1))?;
    let v: Array2<T> = v.clone().into_shape((1, v.len()))?;

    Ok(ndarray::linalg::kron(&u, &v))
}

/// Step used to perturb `value` in a central-difference derivative
///
/// The step scales with the magnitude of `value`, with a floor at `relative` so parameters
/// which sit at or near zero are still perturbed.
pub fn finite_difference_step<T: Float>(value: T, relative: T) -> T {
    relative * value.abs().max(T::one())
}

/// The inverse of the normal matrix $J^T J$ and the numerical rank of $J$
#[derive(Clone, Debug)]
pub struct NormalInverse {
    pub inverse: Array2<f64>,
    pub rank: usize,
}

impl NormalInverse {
    pub fn is_full_rank(&self) -> bool {
        self.rank == self.inverse.ncols()
    }
}

/// Invert the normal matrix of `jacobian` through its singular value decomposition
///
/// With $J = U S V^T$ the inverse is
/// $$
///     (J^T J)^{-1} = V S^{-2} V^T = \sum_k \frac{v_k v_k^T}{s_k^2},
/// $$
/// summed over singular values above the cutoff $s_{max} \cdot$ `rtol`. Singular values below the
/// cutoff are treated as zero, in which case the sum is the pseudo-inverse and `rank` is smaller
/// than the number of columns.
///
/// A Jacobian built by finite differences carries errors far above machine precision, so
/// `rtol` should sit well above $\epsilon$ or exactly collinear columns will appear independent.
///
/// # Errors
/// Returns [`FitError::Solver`] if the decomposition fails.
pub fn inverse_normal_matrix(
    jacobian: &Array2<f64>,
    rtol: f64,
) -> ::std::result::Result<NormalInverse, FitError> {
    let p = jacobian.ncols();
    let (_, singular_values, vt) = jacobian
        .svd(false, true)
        .map_err(|e| FitError::Solver(e.to_string()))?;
    let vt = vt.ok_or_else(|| FitError::Solver("SVD returned no right singular vectors".into()))?;

    let s_max = singular_values.iter().copied().fold(0., f64::max);
    let cutoff = s_max * rtol;

    let mut inverse = Array2::zeros((p, p));
    let mut rank = 0;
    for (k, &s) in singular_values.iter().enumerate() {
        if s <= cutoff {
            continue;
        }
        rank += 1;
        let v_k = vt.row(k).to_owned();
        let contribution =
            outer_product(&v_k, &v_k).map_err(|e| FitError::Solver(e.to_string()))?;
        inverse.scaled_add(1. / (s * s), &contribution);
    }

    Ok(NormalInverse { inverse, rank })
}

#[cfg(test)]
mod tests {
    use crate::Result;

    use super::{finite_difference_step, inverse_normal_matrix, outer_product};

    const RTOL: f64 = 1e-8;

    use ndarray::{arr2, Array, Array2};
    use ndarray_linalg::Inverse;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::{rand::Rng, RandomExt};
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn outer_products_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let m = rng.gen::<u8>() as usize;
        let n = rng.gen::<u8>() as usize;
        let u = Array::random_using(m, Uniform::new(0., 10.), &mut rng);
        let v = Array::random_using(n, Uniform::new(0., 10.), &mut rng);

        let outer = outer_product(&u, &v).unwrap();

        for ii in 0..m {
            for jj in 0..n {
                approx::assert_relative_eq!(outer[[ii, jj]], u[ii] * v[jj]);
            }
        }
    }

    #[test]
    fn finite_difference_steps_have_a_floor_near_zero() {
        approx::assert_relative_eq!(finite_difference_step(0.0, 1e-6), 1e-6);
        approx::assert_relative_eq!(finite_difference_step(-250.0, 1e-6), 2.5e-4);
    }

    #[test]
    fn full_rank_normal_matrix_inverse_matches_direct_inverse() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_rows = rng.gen_range(5..20);
        let num_cols = 3;
        let jacobian: Array2<f64> =
            Array::random_using((num_rows, num_cols), Uniform::new(-1., 1.), &mut rng);

        let computed = inverse_normal_matrix(&jacobian, RTOL)?;
        let expected = jacobian.t().dot(&jacobian).inv()?;

        assert!(computed.is_full_rank());
        for (c, e) in computed.inverse.iter().zip(expected.iter()) {
            approx::assert_relative_eq!(c, e, max_relative = 1e-8, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn collinear_columns_reduce_the_rank() -> Result<()> {
        // Second column is twice the first
        let jacobian = arr2(&[[1., 2., 0.5], [2., 4., -1.], [3., 6., 2.], [4., 8., 0.]]);

        let computed = inverse_normal_matrix(&jacobian, RTOL)?;

        assert_eq!(computed.rank, 2);
        assert!(!computed.is_full_rank());
        Ok(())
    }

    #[test]
    fn a_zero_column_reduces_the_rank() -> Result<()> {
        let jacobian = arr2(&[[1., 0.], [2., 0.], [3., 0.]]);

        let computed = inverse_normal_matrix(&jacobian, RTOL)?;

        assert_eq!(computed.rank, 1);
        Ok(())
    }
}
