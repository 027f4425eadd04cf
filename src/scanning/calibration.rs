//! Piezo-to-galvo calibration.
//!
//! The operator records points `(piezo, lateral, frontal)` where the light sheet is in
//! focus. With at least two points a straight line is fitted per galvo by ordinary least
//! squares, `b = (XᵀX)⁻¹ Xᵀ y` with `X = [1, piezo]`.

use crate::scanning::parameters::SyncCoefficients;
use serde::{Deserialize, Serialize};

/// One manually focused position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Piezo position, micrometers
    pub piezo: f64,
    /// Lateral z galvo, volts
    pub lateral: f64,
    /// Frontal z galvo, volts
    pub frontal: f64,
}

/// Fitted coefficients for both z galvos.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalvoCalibration {
    /// Lateral galvo
    pub lateral: SyncCoefficients,
    /// Frontal galvo
    pub frontal: SyncCoefficients,
}

/// Calibration points and the fit derived from them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    points: Vec<CalibrationPoint>,
    fit: Option<GalvoCalibration>,
}

impl Calibration {
    /// No points, no fit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded points.
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Current fit, if at least two distinct piezo positions were recorded.
    pub fn fit(&self) -> Option<GalvoCalibration> {
        self.fit
    }

    /// Record a point and refit. Returns whether a fit is available.
    pub fn add_point(&mut self, point: CalibrationPoint) -> bool {
        self.points.push(point);
        self.refit()
    }

    /// Drop the last point and refit. Returns whether a fit is available.
    pub fn remove_last_point(&mut self) -> bool {
        self.points.pop();
        self.refit()
    }

    fn refit(&mut self) -> bool {
        self.fit = fit_lines(&self.points);
        if let Some(fit) = &self.fit {
            tracing::debug!(n_points = self.points.len(), ?fit, "calibration updated");
        }
        self.fit.is_some()
    }
}

/// Least-squares lines through the points; `None` with fewer than two points or when all
/// piezo positions coincide.
pub fn fit_lines(points: &[CalibrationPoint]) -> Option<GalvoCalibration> {
    if points.len() < 2 {
        return None;
    }

    // XᵀX = [[n, Σz], [Σz, Σz²]]
    let n = points.len() as f64;
    let sz: f64 = points.iter().map(|p| p.piezo).sum();
    let szz: f64 = points.iter().map(|p| p.piezo * p.piezo).sum();
    let det = n * szz - sz * sz;
    if det.abs() <= f64::EPSILON * szz.max(1.0) * n {
        return None;
    }

    let solve = |y: &dyn Fn(&CalibrationPoint) -> f64| {
        let sy: f64 = points.iter().map(y).sum();
        let szy: f64 = points.iter().map(|p| p.piezo * y(p)).sum();
        // (XᵀX)⁻¹ Xᵀy
        let offset = (szz * sy - sz * szy) / det;
        let slope = (n * szy - sz * sy) / det;
        SyncCoefficients::new(offset, slope)
    };

    Some(GalvoCalibration {
        lateral: solve(&|p: &CalibrationPoint| p.lateral),
        frontal: solve(&|p: &CalibrationPoint| p.frontal),
    })
}
