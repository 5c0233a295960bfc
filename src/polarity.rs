//! Source polarities and the chopping sequence
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Zero,
    Positive,
    Negative,
}

/// The drift-cancelling sequence: zero readings bracket both the forward and reverse pairs
pub const CHOPPED_SEQUENCE: [Polarity; 7] = [
    Polarity::Zero,
    Polarity::Positive,
    Polarity::Negative,
    Polarity::Zero,
    Polarity::Negative,
    Polarity::Positive,
    Polarity::Zero,
];

/// A single burst with the source off, used when the quantity of interest needs no stimulus
pub const ZERO_ONLY_SEQUENCE: [Polarity; 1] = [Polarity::Zero];

impl Polarity {
    pub const fn sign(self) -> f64 {
        match self {
            Self::Zero => 0.0,
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }

    /// Signed setpoint for a nominal magnitude
    pub fn setpoint(self, nominal: f64) -> f64 {
        nominal.abs() * self.sign()
    }

    /// Whether `reading` is an overload artifact for this polarity and setpoint
    ///
    /// At zero polarity the expected reading is close to zero, so nothing is rejected.
    pub fn is_overload(self, reading: f64, setpoint: f64, multiplier: f64) -> bool {
        match self {
            Self::Zero => false,
            Self::Positive | Self::Negative => reading.abs() > (multiplier * setpoint).abs(),
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "zero"),
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

/// A raw reading tagged with the polarity and sequence step under which it was taken
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolaritySample {
    pub step: usize,
    pub polarity: Polarity,
    pub setpoint: f64,
    pub reading: f64,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Polarity, CHOPPED_SEQUENCE};

    const MULTIPLIER: f64 = 10.0;

    #[test]
    fn sequence_is_balanced() {
        let count = |p| CHOPPED_SEQUENCE.iter().filter(|&&q| q == p).count();
        assert_eq!(count(Polarity::Zero), 3);
        assert_eq!(count(Polarity::Positive), 2);
        assert_eq!(count(Polarity::Negative), 2);
        assert_eq!(CHOPPED_SEQUENCE.first(), Some(&Polarity::Zero));
        assert_eq!(CHOPPED_SEQUENCE.last(), Some(&Polarity::Zero));
    }

    #[test]
    fn setpoints_follow_polarity_sign() {
        assert_eq!(Polarity::Positive.setpoint(5.0), 5.0);
        assert_eq!(Polarity::Negative.setpoint(5.0), -5.0);
        assert_eq!(Polarity::Zero.setpoint(5.0), 0.0);
    }

    proptest! {
        #[test]
        fn eleven_times_setpoint_is_rejected(setpoint in 1e-6..1e3f64, sign in prop::bool::ANY) {
            let polarity = if sign { Polarity::Positive } else { Polarity::Negative };
            let setpoint = polarity.setpoint(setpoint);
            prop_assert!(polarity.is_overload(11.0 * setpoint, setpoint, MULTIPLIER));
            prop_assert!(polarity.is_overload(-11.0 * setpoint, setpoint, MULTIPLIER));
        }

        #[test]
        fn nine_times_setpoint_is_accepted(setpoint in 1e-6..1e3f64, sign in prop::bool::ANY) {
            let polarity = if sign { Polarity::Positive } else { Polarity::Negative };
            let setpoint = polarity.setpoint(setpoint);
            prop_assert!(!polarity.is_overload(9.0 * setpoint, setpoint, MULTIPLIER));
            prop_assert!(!polarity.is_overload(-9.0 * setpoint, setpoint, MULTIPLIER));
        }

        #[test]
        fn zero_polarity_accepts_everything(reading in -1e12..1e12f64) {
            prop_assert!(!Polarity::Zero.is_overload(reading, 0.0, MULTIPLIER));
        }
    }
}
