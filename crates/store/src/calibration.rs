// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SIM921 calibration curve loading (`spec.md` §3, §4.1 composite
//! regulating-temperature command).
//!
//! Grounded on `devices.py`'s `_load_calibration_curve`: a two-column
//! whitespace-separated file of `temperature resistance` pairs, strictly
//! increasing in resistance, loaded into the bridge with a `CINI` command
//! followed by one `CAPT` per point.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("could not read curve file {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("curve file {path} line {line}: expected 'temperature resistance', got {text:?}")]
    Malformed { path: String, line: usize, text: String },

    #[error("curve must be strictly increasing in resistance, violated at point {index}")]
    NotMonotonic { index: usize },

    #[error("curve has fewer than two points")]
    TooShort,

    #[error("curve number must be 1, 2, or 3, got {0}")]
    BadCurveNumber(u8),
}

/// SIM921 curve shape, mirrors `CURVE_TYPE_DICT` in the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveType {
    Linear,
    SemiLogT,
    SemiLogR,
    LogLog,
}

impl CurveType {
    fn wire_code(self) -> &'static str {
        match self {
            CurveType::Linear => "0",
            CurveType::SemiLogT => "1",
            CurveType::SemiLogR => "2",
            CurveType::LogLog => "3",
        }
    }
}

/// A loaded calibration curve: ascending-resistance `(temperature, resistance)` points.
#[derive(Debug, Clone)]
pub struct Curve {
    points: Vec<(f64, f64)>,
}

impl Curve {
    /// Load and validate a curve file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| CalibrationError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;

        let mut points = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(temp), Some(res)) = (fields.next(), fields.next()) else {
                return Err(CalibrationError::Malformed {
                    path: path_ref.display().to_string(),
                    line: i + 1,
                    text: line.to_owned(),
                });
            };
            let (temp, res): (f64, f64) = match (temp.parse(), res.parse()) {
                (Ok(t), Ok(r)) => (t, r),
                _ => {
                    return Err(CalibrationError::Malformed {
                        path: path_ref.display().to_string(),
                        line: i + 1,
                        text: line.to_owned(),
                    })
                }
            };
            points.push((temp, res));
        }

        Self::from_points(points)
    }

    /// Build a curve directly from points, sorting by ascending resistance
    /// (the original flips a descending-temperature file into this order).
    pub fn from_points(mut points: Vec<(f64, f64)>) -> Result<Self, CalibrationError> {
        if points.len() < 2 {
            return Err(CalibrationError::TooShort);
        }
        points.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (i, pair) in points.windows(2).enumerate() {
            if pair[1].1 <= pair[0].1 {
                return Err(CalibrationError::NotMonotonic { index: i + 1 });
            }
        }
        Ok(Self { points })
    }

    /// Piecewise-linear interpolation from temperature to resistance.
    pub fn temperature_to_resistance(&self, temp: f64) -> f64 {
        interpolate(&self.points, temp, |p| p.0, |p| p.1)
    }

    /// Piecewise-linear interpolation from resistance to temperature.
    pub fn resistance_to_temperature(&self, resistance: f64) -> f64 {
        let mut by_resistance: Vec<(f64, f64)> = self.points.iter().map(|&(t, r)| (r, t)).collect();
        by_resistance.sort_by(|a, b| a.0.total_cmp(&b.0));
        interpolate(&by_resistance, resistance, |p| p.0, |p| p.1)
    }

    /// The `CINI`/`CAPT` wire sequence to load this curve as `curve_num`
    /// (`devices.py`: `CINI {num}, {type}, {name}` then one `CAPT` per point).
    pub fn load_sequence(&self, curve_num: u8, curve_type: CurveType, name: &str) -> Result<Vec<String>, CalibrationError> {
        if !(1..=3).contains(&curve_num) {
            return Err(CalibrationError::BadCurveNumber(curve_num));
        }
        let mut cmds = Vec::with_capacity(self.points.len() + 1);
        cmds.push(format!("CINI {curve_num}, {}, {name}", curve_type.wire_code()));
        for &(temp, res) in &self.points {
            cmds.push(format!("CAPT {curve_num}, {res}, {temp}"));
        }
        Ok(cmds)
    }
}

fn interpolate(points: &[(f64, f64)], x: f64, xf: impl Fn(&(f64, f64)) -> f64, yf: impl Fn(&(f64, f64)) -> f64) -> f64 {
    if x <= xf(&points[0]) {
        return yf(&points[0]);
    }
    if x >= xf(&points[points.len() - 1]) {
        return yf(&points[points.len() - 1]);
    }
    let idx = points.partition_point(|p| xf(p) < x).max(1);
    let (lo, hi) = (&points[idx - 1], &points[idx]);
    let t = (x - xf(lo)) / (xf(hi) - xf(lo));
    yf(lo) + t * (yf(hi) - yf(lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_curve() -> Curve {
        Curve::from_points(vec![(4.0, 100.0), (1.0, 1000.0), (0.1, 10000.0)]).unwrap()
    }

    #[test]
    fn rejects_non_monotonic_points() {
        let err = Curve::from_points(vec![(1.0, 100.0), (2.0, 100.0)]).unwrap_err();
        assert!(matches!(err, CalibrationError::NotMonotonic { .. }));
    }

    #[test]
    fn rejects_too_short() {
        assert!(matches!(Curve::from_points(vec![(1.0, 1.0)]), Err(CalibrationError::TooShort)));
    }

    #[test]
    fn interpolates_between_points() {
        let curve = sample_curve();
        let res = curve.temperature_to_resistance(2.5);
        assert!(res > 100.0 && res < 1000.0);
    }

    #[test]
    fn round_trip_is_approximately_identity_at_knots() {
        let curve = sample_curve();
        let temp = curve.resistance_to_temperature(1000.0);
        assert!((temp - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clamps_outside_range() {
        let curve = sample_curve();
        assert_eq!(curve.temperature_to_resistance(100.0), 100.0);
        assert_eq!(curve.temperature_to_resistance(0.0001), 10000.0);
    }

    #[test]
    fn load_sequence_rejects_bad_curve_number() {
        let curve = sample_curve();
        assert!(matches!(
            curve.load_sequence(9, CurveType::Linear, "rx102a"),
            Err(CalibrationError::BadCurveNumber(9))
        ));
    }

    #[test]
    fn load_sequence_emits_cini_then_capt_per_point() {
        let curve = sample_curve();
        let cmds = curve.load_sequence(1, CurveType::SemiLogR, "rx102a").unwrap();
        assert_eq!(cmds[0], "CINI 1, 2, rx102a");
        assert_eq!(cmds.len(), 4);
        assert!(cmds[1].starts_with("CAPT 1, "));
    }
}
