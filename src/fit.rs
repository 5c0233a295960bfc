//! Global bias current and input resistance from several resistors
//!
//! A meter with input bias current $I_b$ and input resistance $R_\text{in}$, left open across a
//! resistor $R$, reads $V = I_b R R_\text{in} / (R + R_\text{in})$. Inverting,
//!
//! $$
//!     \frac{1}{V} = \frac{1}{I_b R_\text{in}} + \frac{1}{I_b} \frac{1}{R},
//! $$
//!
//! a straight line in $(1/R, 1/V)$ with intercept $c$ and slope $m$, so that $I_b = 1/m$ and
//! $R_\text{in} = m / c$.
//!
//! The fitted coefficients are expressed as linear combinations of the input points, so their
//! uncertainty and their correlation follow from the inputs rather than from the scatter.
use itertools::Itertools;
use ndarray::{array, Array1, Axis};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::vandermonde;
use crate::minimisation::LineProblem;
use crate::uncertain::UncertainValue;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Weighted least squares, with uncertainty in `y` only
    #[default]
    #[value(name = "wls")]
    WeightedLeastSquares,
    /// Weighted total least squares, with uncertainty in both coordinates
    #[value(name = "wtls")]
    WeightedTotalLeastSquares,
}

impl FitMethod {
    /// # Errors
    /// See [`line_fit_wls`] and [`line_fit_wtls`].
    pub fn fit(self, x: &[UncertainValue], y: &[UncertainValue]) -> Result<LineFit> {
        match self {
            Self::WeightedLeastSquares => line_fit_wls(x, y),
            Self::WeightedTotalLeastSquares => line_fit_wtls(x, y),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LineFit {
    pub intercept: UncertainValue,
    pub slope: UncertainValue,
}

fn check_points(x: &[UncertainValue], y: &[UncertainValue]) -> Result<()> {
    if x.len() != y.len() {
        return Err(Error::Fit(format!(
            "{} abscissae but {} ordinates",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 2 || x.iter().map(UncertainValue::value).all_equal() {
        return Err(Error::Fit(
            "at least two distinct resistors are needed".to_owned(),
        ));
    }
    if let Some(point) = x
        .iter()
        .chain(y)
        .find(|value| !value.value().is_finite() || !value.uncertainty().is_finite())
    {
        return Err(Error::Fit(format!("point {point} is not finite")));
    }
    if y.iter().any(|value| value.uncertainty() == 0.0) {
        return Err(Error::Fit(
            "every ordinate needs a non-zero uncertainty to weight it".to_owned(),
        ));
    }
    Ok(())
}

fn values(points: &[UncertainValue]) -> Array1<f64> {
    points.iter().map(UncertainValue::value).collect()
}

fn uncertainties(points: &[UncertainValue]) -> Array1<f64> {
    points.iter().map(UncertainValue::uncertainty).collect()
}

/// Straight line through `(x, y)`, weighting each point by $1 / u^2(y)$
///
/// The abscissae are treated as exact.
///
/// # Errors
/// Fewer than two distinct abscissae, mismatched lengths, or ordinates without uncertainty.
pub fn line_fit_wls(x: &[UncertainValue], y: &[UncertainValue]) -> Result<LineFit> {
    check_points(x, y)?;

    let design = vandermonde(&values(x).to_vec(), 1).map_err(|e| Error::Fit(e.to_string()))?;
    let weights = uncertainties(y).mapv(|u| u.powi(-2));
    let weighted = &design * &weights.insert_axis(Axis(1));

    let covariance = design
        .t()
        .dot(&weighted)
        .inv()
        .map_err(|e| Error::Fit(e.to_string()))?;
    // Row `ii` holds the derivative of each coefficient with respect to `y[ii]`
    let gain = weighted.dot(&covariance);
    let coefficients = gain.t().dot(&values(y));

    let coefficient = |jj: usize| {
        let terms: Vec<(f64, &UncertainValue)> = y
            .iter()
            .enumerate()
            .map(|(ii, yi)| (gain[[ii, jj]], yi))
            .collect();
        UncertainValue::linear_combination(coefficients[jj], &terms)
    };

    Ok(LineFit {
        intercept: coefficient(0),
        slope: coefficient(1),
    })
}

/// Straight line through `(x, y)` accounting for the uncertainty of both coordinates
///
/// The weighted least squares line is used as the starting point. Sensitivities of the
/// coefficients to each point are taken from the linearised problem at the solution.
///
/// # Errors
/// As for [`line_fit_wls`], or if the solver fails.
pub fn line_fit_wtls(x: &[UncertainValue], y: &[UncertainValue]) -> Result<LineFit> {
    let initial = line_fit_wls(x, y)?;

    let problem = LineProblem::new(values(x), values(y), uncertainties(x), uncertainties(y));
    let solution = problem
        .clone()
        .solve(array![initial.intercept.value(), initial.slope.value()])?;

    let slope = solution[1];
    let jacobian = problem.jacobian_matrix(&solution);
    let scale = problem.scale(slope);
    let covariance = jacobian
        .t()
        .dot(&jacobian)
        .inv()
        .map_err(|e| Error::Fit(e.to_string()))?;
    let gain = jacobian.dot(&covariance);

    let coefficient = |jj: usize| {
        let terms: Vec<(f64, &UncertainValue)> = x
            .iter()
            .zip(y)
            .enumerate()
            .flat_map(|(ii, (xi, yi))| {
                [
                    (-gain[[ii, jj]] / scale[ii], yi),
                    (gain[[ii, jj]] * slope / scale[ii], xi),
                ]
            })
            .collect();
        UncertainValue::linear_combination(solution[jj], &terms)
    };

    Ok(LineFit {
        intercept: coefficient(0),
        slope: coefficient(1),
    })
}

#[derive(Clone, Debug)]
pub struct FitResult {
    pub line: LineFit,
    pub bias_current: UncertainValue,
    pub input_resistance: UncertainValue,
}

/// Fit the loading model to `(resistance, open-circuit voltage)` pairs
///
/// # Errors
/// See [`FitMethod::fit`].
pub fn fit_bias_and_input_resistance(
    points: &[(UncertainValue, UncertainValue)],
    method: FitMethod,
) -> Result<FitResult> {
    let x: Vec<UncertainValue> = points.iter().map(|(r, _)| r.recip()).collect();
    let y: Vec<UncertainValue> = points.iter().map(|(_, v)| v.recip()).collect();

    let line = method.fit(&x, &y)?;
    let bias_current = line.slope.recip();
    let input_resistance = &line.slope / &line.intercept;

    tracing::info!(
        ?method,
        points = points.len(),
        %bias_current,
        %input_resistance,
        "fitted loading model"
    );

    Ok(FitResult {
        line,
        bias_current,
        input_resistance,
    })
}
