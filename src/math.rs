use ndarray::{Array, Array2};
use ndarray_linalg::Scalar;
use num_traits::Float;

use crate::uncertain::UncertainValue;

/// Arithmetic mean of `samples`, `None` when there are none
pub fn mean<T: Float>(samples: &[T]) -> Option<T> {
    let n = T::from(samples.len())?;
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().fold(T::zero(), |acc, &x| acc + x) / n)
}

/// Unbiased sample variance of `samples`, `None` when there are fewer than two
pub fn sample_variance<T: Float>(samples: &[T]) -> Option<T> {
    if samples.len() < 2 {
        return None;
    }
    let mean = mean(samples)?;
    let n_minus_one = T::from(samples.len() - 1)?;
    Some(
        samples
            .iter()
            .fold(T::zero(), |acc, &x| acc + (x - mean).powi(2))
            / n_minus_one,
    )
}

/// Type-A evaluation of a list of repeated readings
///
/// The result is the sample mean, with the experimental standard deviation of the mean as its
/// standard uncertainty and $n - 1$ degrees of freedom. With fewer than two readings the
/// uncertainty cannot be estimated and the degrees of freedom are undefined; with no readings
/// the value is not-a-number as well.
#[allow(clippy::cast_precision_loss)]
pub fn estimate(readings: &[f64]) -> UncertainValue {
    match (mean(readings), sample_variance(readings)) {
        (Some(mean), Some(variance)) => {
            let n = readings.len() as f64;
            UncertainValue::new(mean, (variance / n).sqrt(), n - 1.0)
        }
        (Some(mean), None) => UncertainValue::undefined(mean),
        _ => UncertainValue::undefined(f64::NAN),
    }
}

/// Generate the Vandermode matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is a (n + 1 x m + 1) matrix. Each rows of the matrix is a geometric
/// progression for an individual observation variable `x` from power `0` to `degree` inclusive.
/// A `degree` of one gives the design matrix of a straight-line fit.
///
/// # Panics
///
/// The generator panics in the event that `degree` cannot be converted to `i32`.
///
/// # Examples
///
/// ```
/// use dvm_zin::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2).unwrap();
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Copy + Scalar>(
    x: &[T],
    degree: usize,
) -> Result<Array2<T>, ndarray::ShapeError> {
    let vals = x.iter().flat_map(|xi| {
        (0..=degree).map(|i| xi.powi(i32::try_from(i).expect("{i} doesn't fit in `i32`")))
    });

    Array::from_iter(vals).into_shape((x.len(), degree + 1))
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::{Distribution, Normal};
    use rand_isaac::isaac64::Isaac64Rng;

    use super::{estimate, mean, sample_variance, vandermonde};
    use crate::uncertain::Dof;

    #[test]
    fn vandermonde_matrices_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_data_points = 10;
        let degree = 1;

        let data_points = (0..num_data_points)
            .map(|_| rng.gen())
            .collect::<Vec<f64>>();

        let vandermonde = vandermonde(&data_points, degree).unwrap();

        for (ii, data_point) in data_points.iter().enumerate() {
            approx::assert_relative_eq!(vandermonde[[ii, 0]], 1.0);
            approx::assert_relative_eq!(vandermonde[[ii, 1]], *data_point);
        }
    }

    #[test]
    fn means_and_variances_match_hand_calculation() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];

        approx::assert_relative_eq!(mean(&samples).unwrap(), 5.0);
        approx::assert_relative_eq!(sample_variance(&samples).unwrap(), 32.0 / 7.0);
        assert!(mean::<f64>(&[]).is_none());
        assert!(sample_variance(&[1.0]).is_none());
    }

    #[test]
    fn estimates_use_the_standard_deviation_of_the_mean() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_samples = 20;
        let distribution = Normal::new(1.234, 1e-6).unwrap();
        let samples = (0..num_samples)
            .map(|_| distribution.sample(&mut rng))
            .collect::<Vec<f64>>();

        let estimate = estimate(&samples);

        approx::assert_relative_eq!(estimate.value(), mean(&samples).unwrap());
        approx::assert_relative_eq!(
            estimate.uncertainty(),
            (sample_variance(&samples).unwrap() / 20.0).sqrt(),
            max_relative = 1e-12
        );
        assert_eq!(estimate.dof(), Dof::Finite(19.0));
    }

    #[test]
    fn short_lists_give_undefined_estimates_not_zero() {
        let single = estimate(&[0.5]);
        approx::assert_relative_eq!(single.value(), 0.5);
        assert!(single.dof().is_undefined());

        let empty = estimate(&[]);
        assert!(empty.value().is_nan());
        assert!(empty.is_dud());
    }
}
