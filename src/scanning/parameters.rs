//! Scan parameter snapshot consumed by the scan loop every tick.
//!
//! A [`ScanParameters`] value is produced on every settings change and sent to the
//! scanner. It is compared by value: any difference triggers a loop reinitialization.

use crate::error::{AppResult, DslmError};
use crate::waveforms::{lcm, TriangleWaveform};
use serde::{Deserialize, Serialize};

/// Scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanningMode {
    /// No board session open
    #[default]
    Paused,
    /// Single plane, free-running camera
    Planar,
    /// Piezo sweeps, camera triggered once per plane
    Volumetric,
    /// Single plane, camera triggered at a fixed frequency
    TriggeredPlanar,
}

/// Phase of the xy sweeps, in periods.
pub const XY_PHASE: f64 = 0.25;

/// Triangle sweep of one xy galvo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyScanning {
    /// Low end of the sweep, volts
    pub vmin: f64,
    /// High end of the sweep, volts
    pub vmax: f64,
    /// Sweep frequency, Hz
    pub frequency: f64,
}

impl Default for XyScanning {
    fn default() -> Self {
        Self {
            vmin: 0.0,
            vmax: 0.5,
            frequency: 500.0,
        }
    }
}

impl XyScanning {
    /// Waveform generating this sweep.
    ///
    /// The sweep starts at mid-range and reaches `vmax` a quarter period in.
    pub fn waveform(&self) -> TriangleWaveform {
        TriangleWaveform::new(self.frequency, self.vmin, self.vmax).with_phase(XY_PHASE)
    }
}

/// Lateral and frontal xy sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanarScanning {
    /// Lateral galvo
    pub lateral: XyScanning,
    /// Frontal galvo
    pub frontal: XyScanning,
}

/// Affine map from piezo position to a synchronized galvo voltage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncCoefficients {
    /// Voltage at piezo position 0
    pub offset: f64,
    /// Volts per micrometer
    pub slope: f64,
}

impl SyncCoefficients {
    /// Create coefficients.
    pub fn new(offset: f64, slope: f64) -> Self {
        Self { offset, slope }
    }

    /// `offset + slope * z`
    #[inline]
    pub fn apply(&self, z: f64) -> f64 {
        self.offset + self.slope * z
    }
}

/// Fixed piezo and galvo positions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ZManual {
    /// Piezo position, micrometers
    pub piezo: f64,
    /// Lateral z galvo, volts
    pub lateral: f64,
    /// Frontal z galvo, volts
    pub frontal: f64,
}

/// Fixed piezo position with galvos following the calibration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ZSynced {
    /// Piezo position, micrometers
    pub piezo: f64,
    /// Lateral galvo calibration
    pub lateral_sync: SyncCoefficients,
    /// Frontal galvo calibration
    pub frontal_sync: SyncCoefficients,
}

/// Piezo sawtooth sweep with galvos following the recorded piezo position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZScanning {
    /// Sweep start, micrometers
    pub piezo_min: f64,
    /// Sweep end, micrometers
    pub piezo_max: f64,
    /// Volume rate, Hz
    pub frequency: f64,
    /// Lateral galvo calibration
    pub lateral_sync: SyncCoefficients,
    /// Frontal galvo calibration
    pub frontal_sync: SyncCoefficients,
}

impl Default for ZScanning {
    fn default() -> Self {
        Self {
            piezo_min: 0.0,
            piezo_max: 0.0,
            frequency: 1.0,
            lateral_sync: SyncCoefficients::default(),
            frontal_sync: SyncCoefficients::default(),
        }
    }
}

/// Z axis control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ZParameters {
    /// Constant piezo and galvo values
    Manual(ZManual),
    /// Constant piezo, galvos through the calibration
    Synced(ZSynced),
    /// Swept piezo
    Scanning(ZScanning),
}

impl Default for ZParameters {
    fn default() -> Self {
        ZParameters::Manual(ZManual::default())
    }
}

/// Camera triggering.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggeringParameters {
    /// Pulse slots per volume
    pub n_planes: usize,
    /// Slots skipped at the start of the sweep
    pub n_skip_start: usize,
    /// Slots skipped at the end of the sweep
    pub n_skip_end: usize,
    /// Trigger frequency for planar modes, Hz
    pub frequency: Option<f64>,
}

impl TriggeringParameters {
    /// Trigger frequency if set and nonzero.
    pub fn active_frequency(&self) -> Option<f64> {
        self.frequency.filter(|f| *f > 0.0)
    }
}

/// Complete scan configuration for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Scan mode
    pub mode: ScanningMode,
    /// Z control
    pub z: ZParameters,
    /// XY sweeps
    pub xy: PlanarScanning,
    /// Camera triggering
    pub triggering: TriggeringParameters,
}

/// Samples per period of a signal at `frequency`, at least 1.
pub fn samples_per_period(sample_rate: f64, frequency: f64) -> usize {
    ((sample_rate / frequency).round() as usize).max(1)
}

impl ScanParameters {
    /// Check that the parameters describe a runnable scan for their mode.
    pub fn validate(&self) -> AppResult<()> {
        if self.mode == ScanningMode::Paused {
            return Ok(());
        }
        for (name, xy) in [("lateral", &self.xy.lateral), ("frontal", &self.xy.frontal)] {
            if !(xy.frequency > 0.0) {
                return Err(DslmError::InvalidParameters(format!(
                    "{name} xy frequency must be positive, got {}",
                    xy.frequency
                )));
            }
        }
        match (self.mode, &self.z) {
            (ScanningMode::Volumetric, ZParameters::Scanning(z)) => {
                if !(z.frequency > 0.0) {
                    return Err(DslmError::InvalidParameters(format!(
                        "volume rate must be positive, got {}",
                        z.frequency
                    )));
                }
            }
            (ScanningMode::Volumetric, _) => {
                return Err(DslmError::InvalidParameters(
                    "volumetric scanning needs a scanning z configuration".to_string(),
                ));
            }
            (_, ZParameters::Scanning(_)) => {
                return Err(DslmError::InvalidParameters(
                    "planar scanning needs a manual or synced z configuration".to_string(),
                ));
            }
            _ => {}
        }
        if self.mode == ScanningMode::TriggeredPlanar && self.triggering.active_frequency().is_none()
        {
            return Err(DslmError::InvalidParameters(
                "triggered planar scanning needs a trigger frequency".to_string(),
            ));
        }
        Ok(())
    }

    /// Period shared by both xy sweeps, in samples.
    pub fn xy_period(&self, sample_rate: f64) -> usize {
        lcm(
            samples_per_period(sample_rate, self.xy.lateral.frequency),
            samples_per_period(sample_rate, self.xy.frontal.frequency),
        )
        .max(1)
    }

    /// Samples per full repeat of every synchronized waveform in the current mode.
    pub fn scan_period(&self, sample_rate: f64) -> usize {
        let xy = self.xy_period(sample_rate);
        match self.mode {
            ScanningMode::Paused => xy,
            ScanningMode::Planar => match self.triggering.active_frequency() {
                Some(f) => lcm(samples_per_period(sample_rate, f), xy),
                None => xy,
            },
            ScanningMode::TriggeredPlanar => match self.triggering.active_frequency() {
                Some(f) => lcm(samples_per_period(sample_rate, f), xy),
                None => xy,
            },
            ScanningMode::Volumetric => match &self.z {
                ZParameters::Scanning(z) => lcm(samples_per_period(sample_rate, z.frequency), xy),
                _ => xy,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveforms::Waveform;

    fn volumetric(frequency: f64) -> ScanParameters {
        ScanParameters {
            mode: ScanningMode::Volumetric,
            z: ZParameters::Scanning(ZScanning {
                piezo_min: 180.0,
                piezo_max: 220.0,
                frequency,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_scan_period_per_mode() {
        let sr = 40_000.0;
        let mut params = ScanParameters {
            mode: ScanningMode::Planar,
            ..Default::default()
        };
        params.xy.lateral.frequency = 500.0; // 80 samples
        params.xy.frontal.frequency = 400.0; // 100 samples
        assert_eq!(params.scan_period(sr), 400);

        params.triggering.frequency = Some(30.0); // 1333 samples
        assert_eq!(params.scan_period(sr), lcm(1333, 400));

        params.mode = ScanningMode::TriggeredPlanar;
        assert_eq!(params.scan_period(sr), lcm(1333, 400));

        assert_eq!(volumetric(4.0).scan_period(sr), 10_000);
    }

    #[test]
    fn test_volumetric_period_covers_whole_xy_cycles() {
        let sr = 40_000.0;
        // 13333 samples per volume, 80 per xy sweep
        let params = volumetric(3.0);
        let period = params.scan_period(sr);
        assert_eq!(period, 1_066_640);
        assert_eq!(period % 13_333, 0);
        assert_eq!(period % params.xy_period(sr), 0);

        // the lateral sweep is continuous across the wrap
        let lateral = params.xy.lateral.waveform();
        let before = lateral.values(&[(period - 1) as f64 / sr])[0];
        let after = lateral.values(&[0.0])[0];
        let step = (params.xy.lateral.vmax - params.xy.lateral.vmin) * 2.0 / 80.0;
        assert!((before - after).abs() <= step + 1e-9);
    }

    #[test]
    fn test_xy_sweep_starts_mid_range() {
        let xy = XyScanning {
            vmin: 0.0,
            vmax: 1.0,
            frequency: 1.0,
        };
        let values = xy.waveform().values(&[0.0, 0.25, 0.5, 0.75]);
        for (v, e) in values.iter().zip([0.5, 1.0, 0.5, 0.0]) {
            assert!((v - e).abs() < 1e-9, "{values:?}");
        }
    }

    #[test]
    fn test_sync_coefficients() {
        let sync = SyncCoefficients::new(0.5, 0.01);
        assert!((sync.apply(200.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_validate() {
        assert!(ScanParameters::default().validate().is_ok());
        assert!(volumetric(2.0).validate().is_ok());
        assert!(volumetric(0.0).validate().is_err());

        let mut params = volumetric(2.0);
        params.z = ZParameters::Manual(ZManual::default());
        assert!(matches!(
            params.validate(),
            Err(DslmError::InvalidParameters(_))
        ));

        params.mode = ScanningMode::TriggeredPlanar;
        assert!(params.validate().is_err());
        params.triggering.frequency = Some(10.0);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_z_parameters_serde_tag() {
        let json = serde_json::to_string(&ZParameters::Synced(ZSynced::default())).unwrap();
        assert!(json.contains("\"kind\":\"synced\""));
        let back: ZParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ZParameters::Synced(ZSynced::default()));
    }
}
