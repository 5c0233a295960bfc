//! Drift and offset cancellation
//!
//! The zero-polarity readings bracket both the forward and reverse pairs, so their mean is the
//! drift of the meter zero over the sequence. With $\bar V_0$, $\bar V_+$ and $\bar V_-$ the
//! per-polarity means:
//!
//! $$
//!     V_f = \bar V_+ - \bar V_0, \quad V_r = \bar V_- - \bar V_0, \quad
//!     V_\text{off} = \frac{V_f + V_r}{2}, \quad
//!     V = \frac{V_f - V_r}{2} - V_\text{off}.
//! $$
use crate::acquisition::PolarityReadings;
use crate::math::estimate;
use crate::polarity::Polarity;
use crate::uncertain::UncertainValue;

#[derive(Clone, Debug)]
pub struct DriftCorrected {
    pub drift: UncertainValue,
    pub forward: UncertainValue,
    pub reverse: UncertainValue,
    pub offset: UncertainValue,
    pub signal: UncertainValue,
}

/// Combine the three per-polarity reading lists
///
/// Lists with fewer than two readings give undefined degrees of freedom, which carry through to
/// every derived quantity.
pub fn reduce(zero: &[f64], positive: &[f64], negative: &[f64]) -> DriftCorrected {
    let drift = estimate(zero);
    let forward = estimate(positive) - &drift;
    let reverse = estimate(negative) - &drift;
    let offset = (&forward + &reverse) / 2.0;
    let signal = (&forward - &reverse) / 2.0 - &offset;

    DriftCorrected {
        drift,
        forward,
        reverse,
        offset,
        signal,
    }
}

impl From<&PolarityReadings> for DriftCorrected {
    fn from(readings: &PolarityReadings) -> Self {
        reduce(
            &readings.readings(Polarity::Zero),
            &readings.readings(Polarity::Positive),
            &readings.readings(Polarity::Negative),
        )
    }
}
