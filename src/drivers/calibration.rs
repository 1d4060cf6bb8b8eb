use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::drivers::CalibrationError;
use crate::types::{PhysicalUnit, Reading};

pub const TORR_TO_MBAR: f64 = 1.33322;

/// Varian ion pump controller 921-0062 output: monitor voltage (mV) -> pressure (Torr).
pub const VARIAN_921_0062: [(f64, f64); 19] = [
    (5.0, 1.0e-8),
    (10.0, 1.5e-8),
    (15.0, 2.4e-8),
    (20.0, 3.7e-8),
    (25.0, 6.0e-8),
    (30.0, 1.0e-7),
    (35.0, 1.7e-7),
    (40.0, 3.0e-7),
    (45.0, 5.5e-7),
    (50.0, 1.0e-6),
    (55.0, 1.6e-6),
    (60.0, 2.8e-6),
    (65.0, 5.0e-6),
    (70.0, 8.0e-6),
    (75.0, 1.5e-5),
    (80.0, 2.6e-5),
    (85.0, 4.0e-5),
    (90.0, 6.0e-5),
    (95.0, 1.0e-4),
];

/// Monotone piecewise-cubic map from a raw signal to a physical quantity.
///
/// Between control points the curve is a cubic Hermite segment whose tangents follow the
/// Fritsch-Carlson rule, so a monotonic table stays monotonic and a linear table is reproduced
/// exactly. Outside the table the curve continues along the edge tangent.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationCurve {
    inputs: Vec<f64>,
    outputs: Vec<f64>,
    tangents: Vec<f64>,
}

impl CalibrationCurve {
    pub fn new(points: &[(f64, f64)]) -> Result<Self, CalibrationError> {
        if points.len() < 2 {
            return Err(CalibrationError::InvalidCalibrationTable(format!(
                "need at least 2 control points, got {}",
                points.len()
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(CalibrationError::InvalidCalibrationTable(
                "control points must be finite".to_owned(),
            ));
        }
        if let Some(pair) = points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(CalibrationError::InvalidCalibrationTable(format!(
                "inputs must be strictly increasing ({} followed by {})",
                pair[0].0, pair[1].0
            )));
        }
        let inputs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let outputs: Vec<f64> = points.iter().map(|p| p.1).collect();
        let tangents = fritsch_carlson_tangents(&inputs, &outputs);
        Ok(Self {
            inputs,
            outputs,
            tangents,
        })
    }

    pub fn varian_921_0062() -> Self {
        let inputs: Vec<f64> = VARIAN_921_0062.iter().map(|p| p.0).collect();
        let outputs: Vec<f64> = VARIAN_921_0062.iter().map(|p| p.1).collect();
        let tangents = fritsch_carlson_tangents(&inputs, &outputs);
        Self {
            inputs,
            outputs,
            tangents,
        }
    }

    /// Never panics; NaN in gives NaN out.
    pub fn convert(&self, raw: f64) -> f64 {
        if raw.is_nan() {
            return f64::NAN;
        }
        let last = self.inputs.len() - 1;
        if raw <= self.inputs[0] {
            return self.outputs[0] + self.tangents[0] * (raw - self.inputs[0]);
        }
        if raw >= self.inputs[last] {
            return self.outputs[last] + self.tangents[last] * (raw - self.inputs[last]);
        }
        // First index with input > raw; raw sits in [k, k + 1].
        let k = self
            .inputs
            .partition_point(|&x| x <= raw)
            .saturating_sub(1)
            .min(last - 1);
        let h = self.inputs[k + 1] - self.inputs[k];
        let t = (raw - self.inputs[k]) / h;
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * self.outputs[k]
            + h10 * h * self.tangents[k]
            + h01 * self.outputs[k + 1]
            + h11 * h * self.tangents[k + 1]
    }
}

fn fritsch_carlson_tangents(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|k| (ys[k + 1] - ys[k]) / h[k]).collect();
    if n == 2 {
        return vec![delta[0]; 2];
    }
    let mut d = vec![0.0; n];
    for k in 1..n - 1 {
        if delta[k - 1] * delta[k] > 0.0 {
            let w1 = 2.0 * h[k] + h[k - 1];
            let w2 = h[k] + 2.0 * h[k - 1];
            d[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
        }
    }
    d[0] = edge_tangent(h[0], h[1], delta[0], delta[1]);
    d[n - 1] = edge_tangent(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    d
}

// Three-point end condition, clipped so the end segment cannot overshoot.
fn edge_tangent(h0: f64, h1: f64, m0: f64, m1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * m0 - h0 * m1) / (h0 + h1);
    if d.signum() != m0.signum() {
        0.0
    } else if m0.signum() != m1.signum() && d.abs() > 3.0 * m0.abs() {
        3.0 * m0
    } else {
        d
    }
}

/// Built-in tables selectable from config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPreset {
    Varian9210062,
}

/// Reading -> physical value: input scaling, curve lookup, then unit conversion.
#[derive(Clone, Debug)]
pub struct SampleConverter {
    curve: Option<Arc<CalibrationCurve>>,
    input_scale: f64,
    unit: PhysicalUnit,
}

impl SampleConverter {
    /// Passes the raw value through as volts.
    pub fn identity() -> Self {
        Self {
            curve: None,
            input_scale: 1.0,
            unit: PhysicalUnit::Volt,
        }
    }

    /// `curve` yields Torr; `unit` picks the reported pressure unit.
    pub fn pressure(curve: Arc<CalibrationCurve>, input_scale: f64, unit: PhysicalUnit) -> Self {
        Self {
            curve: Some(curve),
            input_scale,
            unit,
        }
    }

    pub fn unit(&self) -> PhysicalUnit {
        self.unit
    }

    pub fn convert(&self, reading: &Reading) -> f64 {
        let Some(curve) = &self.curve else {
            return reading.raw_value;
        };
        let torr = curve.convert(reading.raw_value * self.input_scale);
        convert_pressure(torr, self.unit)
    }
}

pub fn convert_pressure(torr: f64, unit: PhysicalUnit) -> f64 {
    match unit {
        PhysicalUnit::Mbar => torr * TORR_TO_MBAR,
        PhysicalUnit::Torr | PhysicalUnit::Volt => torr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReadingUnit;
    use std::time::SystemTime;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn linear_table_is_reproduced() {
        let curve = CalibrationCurve::new(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]).unwrap();
        for (raw, expected) in [(1.0, 10.0), (1.5, 15.0), (2.0, 20.0), (2.75, 27.5), (3.0, 30.0)] {
            assert!(close(curve.convert(raw), expected), "{raw}");
        }
    }

    #[test]
    fn extrapolates_past_both_edges() {
        let curve = CalibrationCurve::new(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]).unwrap();
        assert!(close(curve.convert(0.0), 0.0));
        assert!(close(curve.convert(5.0), 50.0));
        let two = CalibrationCurve::new(&[(0.0, 1.0), (1.0, 3.0)]).unwrap();
        assert!(close(two.convert(-1.0), -1.0));
        assert!(close(two.convert(2.0), 5.0));
    }

    #[test]
    fn nan_and_infinite_inputs_do_not_panic() {
        let curve = CalibrationCurve::varian_921_0062();
        assert!(curve.convert(f64::NAN).is_nan());
        assert_eq!(curve.convert(f64::INFINITY), f64::INFINITY);
        let linear = CalibrationCurve::new(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]).unwrap();
        assert_eq!(linear.convert(f64::NEG_INFINITY), f64::NEG_INFINITY);
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(CalibrationCurve::new(&[(1.0, 1.0)]).is_err());
        assert!(CalibrationCurve::new(&[(1.0, 1.0), (1.0, 2.0)]).is_err());
        assert!(CalibrationCurve::new(&[(2.0, 1.0), (1.0, 2.0)]).is_err());
        assert!(CalibrationCurve::new(&[(1.0, f64::NAN), (2.0, 2.0)]).is_err());
    }

    #[test]
    fn varian_table_hits_knots_and_stays_monotonic() {
        let curve = CalibrationCurve::varian_921_0062();
        for (mv, torr) in VARIAN_921_0062 {
            assert!(close(curve.convert(mv), torr));
        }
        let mut prev = curve.convert(5.0);
        let mut mv = 5.0;
        while mv <= 95.0 {
            let next = curve.convert(mv);
            assert!(next >= prev, "dip at {mv} mV");
            prev = next;
            mv += 0.25;
        }
        assert_eq!(curve.convert(42.0), curve.convert(42.0));
    }

    #[test]
    fn converter_scales_input_and_converts_units() {
        let curve = Arc::new(CalibrationCurve::varian_921_0062());
        let reading = Reading {
            sequence: 0,
            timestamp: SystemTime::now(),
            raw_value: 0.050,
            unit: ReadingUnit::Volt,
        };
        let torr = SampleConverter::pressure(curve.clone(), 1000.0, PhysicalUnit::Torr);
        let mbar = SampleConverter::pressure(curve, 1000.0, PhysicalUnit::Mbar);
        assert!(close(torr.convert(&reading), 1.0e-6));
        assert!(close(mbar.convert(&reading), 1.0e-6 * TORR_TO_MBAR));
        assert_eq!(SampleConverter::identity().convert(&reading), 0.050);
    }
}
