//! Derived quantities
use crate::uncertain::UncertainValue;

/// Input bias current from the open-circuit voltage across a single resistor, $I_b = V / R$
pub fn bias_current_approx(voltage: &UncertainValue, resistance: &UncertainValue) -> UncertainValue {
    voltage / resistance
}

/// DVM input resistance from a loaded and a shorted measurement
///
/// With the series resistor `resistance` in circuit the meter reads `voltage`; with it shorted,
/// `source_voltage`. The bias current flowing out of the meter input adds $I_b R$ to the drop:
///
/// $$
///     R_\text{in} = \frac{R V}{V_s - V + I_b R}.
/// $$
pub fn input_resistance(
    resistance: &UncertainValue,
    voltage: &UncertainValue,
    source_voltage: &UncertainValue,
    bias_current: &UncertainValue,
) -> UncertainValue {
    let numerator = resistance * voltage;
    let denominator = source_voltage - voltage + bias_current * resistance;
    numerator / denominator
}

pub fn parallel_resistance(a: &UncertainValue, b: &UncertainValue) -> UncertainValue {
    (a * b) / (a + b)
}

/// Current through a sense resistor `rs`, read by a meter of input resistance `rdvm`
///
/// `v1` and `v2` are the readings with and without the current applied, each corrected by its
/// range gain factor.
pub fn sensed_current(
    v1: &UncertainValue,
    g1: &UncertainValue,
    v2: &UncertainValue,
    g2: &UncertainValue,
    rs: &UncertainValue,
    rdvm: &UncertainValue,
) -> UncertainValue {
    (v1 * g1 - v2 * g2) / parallel_resistance(rs, rdvm)
}

/// Ratio of the measured current to the nominal setting of the source
pub fn source_correction(measured: &UncertainValue, setpoint: f64) -> UncertainValue {
    measured / setpoint
}

/// Whether any of `values` is unusable
pub fn any_dud<'a>(values: impl IntoIterator<Item = &'a UncertainValue>) -> bool {
    values.into_iter().any(UncertainValue::is_dud)
}

#[cfg(test)]
mod tests {
    use super::{
        any_dud, bias_current_approx, input_resistance, parallel_resistance, sensed_current,
        source_correction,
    };
    use crate::uncertain::UncertainValue;

    #[test]
    fn bias_current_scales_the_signal_by_the_resistor() {
        let r0 = UncertainValue::new(100_000.255, 0.145, 125.0);
        let signal = UncertainValue::exact(2.5);

        let ib = bias_current_approx(&signal, &r0);

        approx::assert_relative_eq!(ib.value(), 2.499_993_6e-5, max_relative = 1e-7);
        approx::assert_relative_eq!(
            ib.uncertainty() / ib.value(),
            0.145 / 100_000.255,
            max_relative = 1e-9
        );
    }

    #[test]
    fn input_resistance_recovers_the_loading_model() {
        let rin = 1e10;
        let ib = 2e-11;
        let r = 1e8;
        let vs = 10.0;
        let v = (vs + ib * r) * rin / (r + rin);

        let computed = input_resistance(
            &UncertainValue::new(r, 10.0, 50.0),
            &UncertainValue::new(v, 1e-6, 19.0),
            &UncertainValue::new(vs, 1e-6, 19.0),
            &UncertainValue::new(ib, 1e-13, 30.0),
        );

        approx::assert_relative_eq!(computed.value(), rin, max_relative = 1e-9);
        assert!(!computed.is_dud());
    }

    #[test]
    fn a_very_large_meter_resistance_barely_loads_the_sense_resistor() {
        let rs = UncertainValue::new(999.9969, 5e-4, 10.0);
        let rdvm = UncertainValue::new(1e12, 1.6e11, 10.0);

        let parallel = parallel_resistance(&rs, &rdvm);

        approx::assert_relative_eq!(parallel.value(), 999.9969, max_relative = 2e-9);
    }

    #[test]
    fn source_correction_is_unity_for_an_ideal_source() {
        let rs = UncertainValue::new(1000.0, 1e-3, 10.0);
        let rdvm = UncertainValue::exact(1e15);
        let gain = UncertainValue::exact(1.0);
        let v1 = UncertainValue::new(1e-3 * 1000.0, 1e-8, 9.0);

        let current = sensed_current(&v1, &gain, &UncertainValue::exact(0.0), &gain, &rs, &rdvm);
        let correction = source_correction(&current, 1e-3);

        approx::assert_relative_eq!(correction.value(), 1.0, max_relative = 1e-9);
        assert!(correction.uncertainty() > 0.0);
    }

    #[test]
    fn a_single_dud_poisons_the_set() {
        let good = UncertainValue::new(1.0, 0.1, 10.0);
        let bad = UncertainValue::undefined(1.0);

        assert!(!any_dud([&good, &good]));
        assert!(any_dud([&good, &bad]));
    }
}
