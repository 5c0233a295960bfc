use argmin::core::{Executor, Jacobian, Operator, State};
use argmin::solver::gaussnewton::GaussNewtonLS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use ndarray::{Array1, Array2};

use crate::error::{Error, Result};

/// A straight line fitted to points with uncertainty in both coordinates
///
/// The parameter vector is $[a, b]$ for the line $y = a + b x$. Each point contributes the
/// residual
/// $$
///     r_i = \frac{y_i - a - b x_i}{\sqrt{u^2(y_i) + b^2 u^2(x_i)}},
/// $$
/// its distance from the line in units of its combined uncertainty along $y$. Minimising
/// $\sum_i r_i^2$ gives the weighted total least squares estimate.
#[derive(Clone)]
pub(crate) struct LineProblem {
    x: Array1<f64>,
    y: Array1<f64>,
    ux: Array1<f64>,
    uy: Array1<f64>,
}

impl LineProblem {
    /// The caller guarantees all four arrays have the same length
    pub(crate) const fn new(
        x: Array1<f64>,
        y: Array1<f64>,
        ux: Array1<f64>,
        uy: Array1<f64>,
    ) -> Self {
        Self { x, y, ux, uy }
    }

    /// Combined uncertainty of each point along $y$ for a line of slope `slope`
    pub(crate) fn scale(&self, slope: f64) -> Array1<f64> {
        let mut scale = Array1::zeros(self.x.len());
        for ii in 0..self.x.len() {
            scale[ii] = (self.uy[ii].powi(2) + (slope * self.ux[ii]).powi(2)).sqrt();
        }
        scale
    }

    fn residuals(&self, params: &Array1<f64>) -> Array1<f64> {
        let (intercept, slope) = (params[0], params[1]);
        (&self.y - intercept - &self.x * slope) / &self.scale(slope)
    }

    fn cost(&self, params: &Array1<f64>) -> f64 {
        let residuals = self.residuals(params);
        residuals.dot(&residuals)
    }

    /// Jacobian of the residual vector with respect to $[a, b]$, one row per point
    pub(crate) fn jacobian_matrix(&self, params: &Array1<f64>) -> Array2<f64> {
        let (intercept, slope) = (params[0], params[1]);
        let scale = self.scale(slope);

        let mut jacobian = Array2::zeros((self.x.len(), 2));
        for ii in 0..self.x.len() {
            let s = scale[ii];
            let misfit = self.y[ii] - intercept - slope * self.x[ii];
            jacobian[[ii, 0]] = -s.recip();
            jacobian[[ii, 1]] = -self.x[ii] / s - misfit * slope * self.ux[ii].powi(2) / s.powi(3);
        }
        jacobian
    }

    /// Run the optimisation from `initial_parameters`
    ///
    /// A start that already fits every point exactly is returned unchanged, as the line search
    /// cannot make progress from a zero gradient.
    pub(crate) fn solve(self, initial_parameters: Array1<f64>) -> Result<Array1<f64>> {
        if self.cost(&initial_parameters) <= f64::EPSILON {
            return Ok(initial_parameters);
        }

        let linesearch = MoreThuenteLineSearch::new()
            .with_bounds(0.0, 1.0)
            .map_err(solver_error)?;
        let solver = GaussNewtonLS::new(linesearch)
            .with_tolerance(f64::EPSILON.sqrt())
            .map_err(solver_error)?;

        let res = Executor::new(self, solver)
            .configure(|state| state.param(initial_parameters).max_iters(100))
            .run()
            .map_err(solver_error)?;

        tracing::debug!(
            iterations = res.state().get_iter(),
            cost = res.state().get_cost(),
            "total least squares converged"
        );

        let mut state = res.state().clone();
        state
            .take_param()
            .ok_or_else(|| Error::Fit("solver returned no parameters".to_owned()))
    }
}

#[allow(clippy::needless_pass_by_value)]
fn solver_error(e: argmin::core::Error) -> Error {
    Error::Fit(e.to_string())
}

impl Operator for LineProblem {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.residuals(p))
    }
}

impl Jacobian for LineProblem {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        Ok(self.jacobian_matrix(p))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::LineProblem;

    #[test]
    fn jacobian_matches_finite_difference() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_points = 6;

        let x: Array1<f64> = Array1::from_iter((0..num_points).map(|_| rng.gen_range(0.0..10.0)));
        let y: Array1<f64> = Array1::from_iter((0..num_points).map(|_| rng.gen_range(0.0..10.0)));
        let ux: Array1<f64> = Array1::from_iter((0..num_points).map(|_| rng.gen_range(0.1..1.0)));
        let uy: Array1<f64> = Array1::from_iter((0..num_points).map(|_| rng.gen_range(0.1..1.0)));
        let problem = LineProblem::new(x, y, ux, uy);

        let params = array![1.3, 0.7];
        let computed = problem.jacobian_matrix(&params);

        let delta_rel = 1e-6;
        for jj in 0..2 {
            let delta = params[jj] * delta_rel;
            let mut plus = params.clone();
            plus[jj] += delta;
            let mut minus = params.clone();
            minus[jj] -= delta;

            let numerical =
                (problem.residuals(&plus) - problem.residuals(&minus)) / (2. * delta);

            for (ii, num) in numerical.into_iter().enumerate() {
                approx::assert_relative_eq!(computed[[ii, jj]], num, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn exact_starts_are_returned_unchanged() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![3.0, 5.0, 7.0];
        let problem = LineProblem::new(x, y, array![0.1, 0.1, 0.1], array![0.1, 0.1, 0.1]);

        let solution = problem.solve(array![1.0, 2.0]).unwrap();

        assert_eq!(solution, array![1.0, 2.0]);
    }

    #[test]
    fn the_solver_walks_downhill_to_the_line() {
        let x = array![0.0, 1.0, 2.0, 3.0, 4.0];
        let y = array![1.1, 2.9, 5.1, 6.9, 9.1];
        let u = array![0.1, 0.1, 0.1, 0.1, 0.1];
        let problem = LineProblem::new(x, y, u.clone(), u);

        let start = array![0.0, 1.0];
        let solution = problem.clone().solve(start.clone()).unwrap();

        assert!(problem.cost(&solution) < problem.cost(&start));
        approx::assert_relative_eq!(solution[1], 2.0, max_relative = 0.05);
    }
}
