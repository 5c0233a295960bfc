//! Uncertain real numbers with first-order uncertainty propagation
//!
//! Every physical quantity handled by the crate is an [`UncertainValue`]: a central value, a
//! standard uncertainty and a number of degrees of freedom. Arithmetic between uncertain values
//! propagates uncertainty to first order (the law of propagation of uncertainty):
//!
//! $$
//!     u^2(y) = \sum_i \left(\frac{\partial y}{\partial x_i}\right)^2 u^2(x_i),
//! $$
//!
//! and combines degrees of freedom with the Welch–Satterthwaite formula
//!
//! $$
//!     \nu_\text{eff} = \frac{u^4(y)}{\sum_i u_i^4(y) / \nu_i}.
//! $$
//!
//! Rather than storing only the combined uncertainty, each value keeps the partial derivatives
//! with respect to the *elementary* inputs it was built from. Two independently created
//! quantities never cancel on subtraction, while a quantity subtracted from itself does, exactly
//! as in a hand-written uncertainty budget.
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

static NEXT_INPUT: AtomicU64 = AtomicU64::new(0);

/// Identity of an elementary input quantity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputId(u64);

impl InputId {
    fn fresh() -> Self {
        Self(NEXT_INPUT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Degrees of freedom attached to an uncertainty
///
/// `Undefined` marks a quantity whose uncertainty could not be estimated (for example the mean of
/// a single reading). It is sticky: anything computed from an undefined input is undefined too.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Dof {
    Finite(f64),
    Infinite,
    Undefined,
}

impl Dof {
    pub const fn is_undefined(self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// `Some(nu)` for finite dof, `Some(f64::INFINITY)` for infinite and `None` when undefined
    pub const fn as_f64(self) -> Option<f64> {
        match self {
            Self::Finite(nu) => Some(nu),
            Self::Infinite => Some(f64::INFINITY),
            Self::Undefined => None,
        }
    }
}

impl From<f64> for Dof {
    fn from(nu: f64) -> Self {
        if nu.is_nan() || nu <= 0.0 {
            Self::Undefined
        } else if nu.is_infinite() {
            Self::Infinite
        } else {
            Self::Finite(nu)
        }
    }
}

impl fmt::Display for Dof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(nu) => write!(f, "{nu:.1}"),
            Self::Infinite => write!(f, "inf"),
            Self::Undefined => write!(f, "undefined"),
        }
    }
}

impl Serialize for Dof {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Finite(nu) => serializer.serialize_f64(*nu),
            Self::Infinite => serializer.serialize_str("inf"),
            Self::Undefined => serializer.serialize_str("nan"),
        }
    }
}

impl<'de> Deserialize<'de> for Dof {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
            Null(()),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(nu) => Ok(Self::from(nu)),
            Repr::Text(text) => match text.to_ascii_lowercase().as_str() {
                "inf" | "infinity" => Ok(Self::Infinite),
                "nan" | "undefined" => Ok(Self::Undefined),
                other => Err(serde::de::Error::custom(format!(
                    "unrecognised degrees of freedom `{other}`"
                ))),
            },
            Repr::Null(()) => Ok(Self::Undefined),
        }
    }
}

/// How strongly a value depends on one elementary input
#[derive(Clone, Copy, Debug)]
struct Influence {
    /// Partial derivative of the value with respect to the input
    derivative: f64,
    /// Standard uncertainty of the input
    uncertainty: f64,
    dof: Dof,
}

impl Influence {
    fn component(&self) -> f64 {
        self.derivative * self.uncertainty
    }
}

/// A real number with a standard uncertainty and degrees of freedom
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "EncodedUncertainValue", try_from = "EncodedUncertainValue")]
pub struct UncertainValue {
    value: f64,
    influences: BTreeMap<InputId, Influence>,
}

impl UncertainValue {
    /// Create an elementary uncertain input
    ///
    /// Each call creates a new independent quantity, even if the arguments are identical to a
    /// previous call.
    pub fn new(value: f64, uncertainty: f64, dof: impl Into<Dof>) -> Self {
        let dof = dof.into();
        let uncertainty = uncertainty.abs();
        let mut influences = BTreeMap::new();
        if uncertainty != 0.0 || dof.is_undefined() {
            influences.insert(
                InputId::fresh(),
                Influence {
                    derivative: 1.0,
                    uncertainty: if uncertainty.is_nan() { 0.0 } else { uncertainty },
                    dof,
                },
            );
        }
        Self { value, influences }
    }

    /// An exactly known number
    pub const fn exact(value: f64) -> Self {
        Self {
            value,
            influences: BTreeMap::new(),
        }
    }

    /// A value whose uncertainty cannot be estimated
    pub fn undefined(value: f64) -> Self {
        Self::new(value, 0.0, Dof::Undefined)
    }

    pub const fn value(&self) -> f64 {
        self.value
    }

    pub fn uncertainty(&self) -> f64 {
        if let Some(influence) = self.sole_influence() {
            return influence.component().abs();
        }
        self.influences
            .values()
            .map(|influence| influence.component().powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Effective degrees of freedom by Welch–Satterthwaite
    pub fn dof(&self) -> Dof {
        if self
            .influences
            .values()
            .any(|influence| influence.dof.is_undefined())
        {
            return Dof::Undefined;
        }
        if let Some(influence) = self.sole_influence() {
            return influence.dof;
        }

        let uncertainty = self.uncertainty();
        if uncertainty == 0.0 {
            return Dof::Infinite;
        }

        let denominator: f64 = self
            .influences
            .values()
            .filter_map(|influence| match influence.dof {
                Dof::Finite(nu) => Some(influence.component().powi(4) / nu),
                _ => None,
            })
            .sum();

        if denominator == 0.0 {
            Dof::Infinite
        } else {
            Dof::from(uncertainty.powi(4) / denominator)
        }
    }

    fn sole_influence(&self) -> Option<&Influence> {
        match self.influences.len() {
            1 => self
                .influences
                .values()
                .next()
                .filter(|influence| influence.component() != 0.0),
            _ => None,
        }
    }

    /// A result that must not be trusted or stored
    ///
    /// True when the degrees of freedom are undefined, or when any of the value, the uncertainty
    /// or the degrees of freedom is not a finite number.
    pub fn is_dud(&self) -> bool {
        let dof_is_usable = match self.dof() {
            Dof::Finite(nu) => nu.is_finite(),
            Dof::Infinite => true,
            Dof::Undefined => false,
        };
        !dof_is_usable || !self.value.is_finite() || !self.uncertainty().is_finite()
    }

    /// The identity of this value when it is an elementary input
    pub fn input_id(&self) -> Option<InputId> {
        match self.influences.iter().next() {
            Some((id, influence))
                if self.influences.len() == 1
                    && (influence.derivative - 1.0).abs() < f64::EPSILON =>
            {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Partial derivative of `self` with respect to an elementary input
    pub fn sensitivity(&self, input: InputId) -> f64 {
        self.influences
            .get(&input)
            .map_or(0.0, |influence| influence.derivative)
    }

    /// Signed uncertainty contribution of an elementary input, `sensitivity * u(input)`
    pub fn component(&self, input: InputId) -> f64 {
        self.influences.get(&input).map_or(0.0, Influence::component)
    }

    /// Build a value that depends linearly on `terms`, given as `(partial derivative, input)`
    ///
    /// This is the primitive from which every operation in this module is built.
    pub(crate) fn linear_combination(value: f64, terms: &[(f64, &Self)]) -> Self {
        let mut influences: BTreeMap<InputId, Influence> = BTreeMap::new();
        for (partial, operand) in terms {
            for (id, influence) in &operand.influences {
                influences
                    .entry(*id)
                    .and_modify(|existing| existing.derivative += partial * influence.derivative)
                    .or_insert(Influence {
                        derivative: partial * influence.derivative,
                        ..*influence
                    });
            }
        }
        Self { value, influences }
    }

    #[must_use]
    pub fn recip(&self) -> Self {
        Self::linear_combination(self.value.recip(), &[(-self.value.powi(-2), self)])
    }

    #[must_use]
    pub fn powi(&self, n: i32) -> Self {
        Self::linear_combination(
            self.value.powi(n),
            &[(f64::from(n) * self.value.powi(n - 1), self)],
        )
    }

    #[must_use]
    pub fn sqrt(&self) -> Self {
        let root = self.value.sqrt();
        Self::linear_combination(root, &[(0.5 / root, self)])
    }
}

impl From<f64> for UncertainValue {
    fn from(value: f64) -> Self {
        Self::exact(value)
    }
}

impl fmt::Display for UncertainValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let precision = f.precision().unwrap_or(6);
        write!(
            f,
            "{:.*e} ± {:.1e} (dof {})",
            precision,
            self.value,
            self.uncertainty(),
            self.dof()
        )
    }
}

impl Neg for &UncertainValue {
    type Output = UncertainValue;

    fn neg(self) -> UncertainValue {
        UncertainValue::linear_combination(-self.value, &[(-1.0, self)])
    }
}

impl Neg for UncertainValue {
    type Output = Self;

    fn neg(self) -> Self {
        -&self
    }
}

impl Add for &UncertainValue {
    type Output = UncertainValue;

    fn add(self, rhs: Self) -> UncertainValue {
        UncertainValue::linear_combination(self.value + rhs.value, &[(1.0, self), (1.0, rhs)])
    }
}

impl Sub for &UncertainValue {
    type Output = UncertainValue;

    fn sub(self, rhs: Self) -> UncertainValue {
        UncertainValue::linear_combination(self.value - rhs.value, &[(1.0, self), (-1.0, rhs)])
    }
}

impl Mul for &UncertainValue {
    type Output = UncertainValue;

    fn mul(self, rhs: Self) -> UncertainValue {
        UncertainValue::linear_combination(
            self.value * rhs.value,
            &[(rhs.value, self), (self.value, rhs)],
        )
    }
}

impl Div for &UncertainValue {
    type Output = UncertainValue;

    fn div(self, rhs: Self) -> UncertainValue {
        let quotient = self.value / rhs.value;
        UncertainValue::linear_combination(
            quotient,
            &[(rhs.value.recip(), self), (-quotient / rhs.value, rhs)],
        )
    }
}

impl Add<f64> for &UncertainValue {
    type Output = UncertainValue;

    fn add(self, rhs: f64) -> UncertainValue {
        UncertainValue::linear_combination(self.value + rhs, &[(1.0, self)])
    }
}

impl Sub<f64> for &UncertainValue {
    type Output = UncertainValue;

    fn sub(self, rhs: f64) -> UncertainValue {
        UncertainValue::linear_combination(self.value - rhs, &[(1.0, self)])
    }
}

impl Mul<f64> for &UncertainValue {
    type Output = UncertainValue;

    fn mul(self, rhs: f64) -> UncertainValue {
        UncertainValue::linear_combination(self.value * rhs, &[(rhs, self)])
    }
}

impl Div<f64> for &UncertainValue {
    type Output = UncertainValue;

    fn div(self, rhs: f64) -> UncertainValue {
        UncertainValue::linear_combination(self.value / rhs, &[(rhs.recip(), self)])
    }
}

impl Add<&UncertainValue> for f64 {
    type Output = UncertainValue;

    fn add(self, rhs: &UncertainValue) -> UncertainValue {
        rhs + self
    }
}

impl Sub<&UncertainValue> for f64 {
    type Output = UncertainValue;

    fn sub(self, rhs: &UncertainValue) -> UncertainValue {
        UncertainValue::linear_combination(self - rhs.value, &[(-1.0, rhs)])
    }
}

impl Mul<&UncertainValue> for f64 {
    type Output = UncertainValue;

    fn mul(self, rhs: &UncertainValue) -> UncertainValue {
        rhs * self
    }
}

impl Div<&UncertainValue> for f64 {
    type Output = UncertainValue;

    fn div(self, rhs: &UncertainValue) -> UncertainValue {
        &rhs.recip() * self
    }
}

/// Forward the owned and mixed-ownership forms of a binary operator to the `&T op &T` impl
macro_rules! forward_owned_binop {
    ($($trait:ident $method:ident),*) => {
        $(
            impl $trait for UncertainValue {
                type Output = Self;

                fn $method(self, rhs: Self) -> Self {
                    (&self).$method(&rhs)
                }
            }

            impl $trait<&UncertainValue> for UncertainValue {
                type Output = Self;

                fn $method(self, rhs: &UncertainValue) -> Self {
                    (&self).$method(rhs)
                }
            }

            impl $trait<UncertainValue> for &UncertainValue {
                type Output = UncertainValue;

                fn $method(self, rhs: UncertainValue) -> UncertainValue {
                    self.$method(&rhs)
                }
            }

            impl $trait<f64> for UncertainValue {
                type Output = Self;

                fn $method(self, rhs: f64) -> Self {
                    (&self).$method(rhs)
                }
            }

            impl $trait<UncertainValue> for f64 {
                type Output = UncertainValue;

                fn $method(self, rhs: UncertainValue) -> UncertainValue {
                    self.$method(&rhs)
                }
            }
        )*
    };
}

forward_owned_binop!(Add add, Sub sub, Mul mul, Div div);

/// On-disk form of an [`UncertainValue`]
///
/// Only the value, combined uncertainty and effective dof survive encoding. Decoding creates a
/// fresh elementary input, so a reloaded value is independent of everything else in memory.
#[derive(Serialize, Deserialize)]
struct EncodedUncertainValue {
    is_uncertain_value: bool,
    value: f64,
    standard_uncertainty: f64,
    degrees_of_freedom: Dof,
}

impl From<UncertainValue> for EncodedUncertainValue {
    fn from(uncertain: UncertainValue) -> Self {
        Self {
            is_uncertain_value: true,
            value: uncertain.value,
            standard_uncertainty: uncertain.uncertainty(),
            degrees_of_freedom: uncertain.dof(),
        }
    }
}

impl TryFrom<EncodedUncertainValue> for UncertainValue {
    type Error = String;

    fn try_from(encoded: EncodedUncertainValue) -> Result<Self, Self::Error> {
        if !encoded.is_uncertain_value {
            return Err("record is not tagged as an uncertain value".to_owned());
        }
        Ok(Self::new(
            encoded.value,
            encoded.standard_uncertainty,
            encoded.degrees_of_freedom,
        ))
    }
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::{Dof, UncertainValue};

    #[test]
    fn independent_equal_quantities_do_not_cancel_on_subtraction() {
        let a = UncertainValue::new(1.5, 0.3, 10.0);
        let b = UncertainValue::new(1.5, 0.4, 20.0);

        let difference = &a - &b;

        approx::assert_relative_eq!(difference.value(), 0.0);
        approx::assert_relative_eq!(difference.uncertainty(), 0.5);
    }

    #[test]
    fn a_quantity_subtracted_from_itself_is_exact() {
        let a = UncertainValue::new(1.5, 0.3, 10.0);

        let difference = &a - &a;

        approx::assert_relative_eq!(difference.uncertainty(), 0.0);
        assert_eq!(difference.dof(), Dof::Infinite);
    }

    #[test]
    fn arithmetic_with_plain_numbers_keeps_the_uncertainty() {
        let a = UncertainValue::new(2.0, 0.1, 5.0);

        let shifted = &a + 3.0;
        approx::assert_relative_eq!(shifted.value(), 5.0);
        approx::assert_relative_eq!(shifted.uncertainty(), 0.1);
        assert_eq!(shifted.dof(), Dof::Finite(5.0));

        let scaled = 4.0 * &a;
        approx::assert_relative_eq!(scaled.value(), 8.0);
        approx::assert_relative_eq!(scaled.uncertainty(), 0.4);
    }

    #[test]
    fn relative_uncertainties_combine_in_quadrature_for_products_and_quotients() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);

        let a = UncertainValue::new(rng.gen_range(1.0..10.0), rng.gen_range(0.01..0.1), 12.0);
        let b = UncertainValue::new(rng.gen_range(1.0..10.0), rng.gen_range(0.01..0.1), 7.0);

        let expected_relative = ((a.uncertainty() / a.value()).powi(2)
            + (b.uncertainty() / b.value()).powi(2))
        .sqrt();

        let product = &a * &b;
        let quotient = &a / &b;

        approx::assert_relative_eq!(
            product.uncertainty() / product.value(),
            expected_relative,
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(
            quotient.uncertainty() / quotient.value(),
            expected_relative,
            max_relative = 1e-12
        );
    }

    #[test]
    fn welch_satterthwaite_matches_hand_calculation() {
        let a = UncertainValue::new(1.0, 0.3, 4.0);
        let b = UncertainValue::new(1.0, 0.4, 9.0);

        let sum = &a + &b;

        let expected = 0.5_f64.powi(4) / (0.3_f64.powi(4) / 4.0 + 0.4_f64.powi(4) / 9.0);
        match sum.dof() {
            Dof::Finite(nu) => approx::assert_relative_eq!(nu, expected, max_relative = 1e-12),
            other => panic!("expected finite dof, found {other:?}"),
        }
    }

    #[test]
    fn undefined_dof_is_sticky_and_marks_a_dud() {
        let good = UncertainValue::new(1.0, 0.1, 10.0);
        let bad = UncertainValue::undefined(2.0);

        let combined = &(&good * &bad) + 1.0;

        assert!(combined.dof().is_undefined());
        assert!(combined.is_dud());
        assert!(!good.is_dud());
    }

    #[test]
    fn division_by_an_exact_zero_is_carried_as_a_dud() {
        let a = UncertainValue::new(1.0, 0.1, 10.0);
        let zero = UncertainValue::exact(0.0);

        let quotient = &a / &zero;

        assert!(quotient.is_dud());
    }

    #[test]
    fn sensitivities_and_components_are_reported_for_elementary_inputs() {
        let x = UncertainValue::new(3.0, 0.2, 8.0);
        let y = UncertainValue::new(5.0, 0.1, 8.0);

        let f = &x * &y;

        let x_id = x.input_id().unwrap();
        let y_id = y.input_id().unwrap();
        approx::assert_relative_eq!(f.sensitivity(x_id), 5.0);
        approx::assert_relative_eq!(f.sensitivity(y_id), 3.0);
        approx::assert_relative_eq!(f.component(x_id), 1.0);
        approx::assert_relative_eq!(f.component(y_id), 0.3, max_relative = 1e-12);
        assert!(f.input_id().is_none());
    }

    #[test]
    fn encoded_values_use_the_tagged_record() {
        let x = UncertainValue::new(100_000.255, 0.145, 125.0);

        let json = serde_json::to_value(&x).unwrap();

        assert_eq!(json["is_uncertain_value"], serde_json::json!(true));
        assert_eq!(json["value"], serde_json::json!(100_000.255));
        assert_eq!(json["standard_uncertainty"], serde_json::json!(0.145));
        assert_eq!(json["degrees_of_freedom"], serde_json::json!(125.0));
    }

    #[test]
    fn infinite_and_undefined_dof_survive_encoding() {
        let infinite = UncertainValue::new(1.0, 0.5, f64::INFINITY);
        let text = serde_json::to_string(&infinite).unwrap();
        let decoded: UncertainValue = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded.dof(), Dof::Infinite);

        let undefined = UncertainValue::undefined(1.0);
        let text = serde_json::to_string(&undefined).unwrap();
        let decoded: UncertainValue = serde_json::from_str(&text).unwrap();
        assert!(decoded.dof().is_undefined());
    }

    #[test]
    fn untagged_records_are_rejected() {
        let text = r#"{"is_uncertain_value": false, "value": 1.0, "standard_uncertainty": 0.1, "degrees_of_freedom": 3.0}"#;
        assert!(serde_json::from_str::<UncertainValue>(text).is_err());
    }
}
