//! Conversions from operator scan settings to what the workers need.
//!
//! These decide when a settings change must restart the scan loop, how many planes the
//! dispatcher and saver should expect, and where the camera pulses land on the piezo
//! sweep.

use crate::scanning::parameters::{ScanParameters, ScanningMode, ZParameters};

/// Whether sending `new` should also tear down and reopen the board.
///
/// Volumetric timing (buffer lengths, impulse positions) is fixed when the loop is
/// built, so any volumetric change restarts.
pub fn merits_restart(new: &ScanParameters) -> bool {
    new.mode == ScanningMode::Volumetric
}

/// Whether the change from `old` to `new` invalidates volumes being assembled.
pub fn significant_change(new: &ScanParameters, old: &ScanParameters) -> bool {
    new.mode != old.mode || new.triggering.n_planes != old.triggering.n_planes
}

/// Planes actually imaged per volume: skipped turnaround slots are not triggered.
///
/// Every non-volumetric mode produces single-plane volumes.
pub fn effective_n_planes(params: &ScanParameters) -> usize {
    match params.mode {
        ScanningMode::Volumetric => {
            let t = &params.triggering;
            t.n_planes
                .saturating_sub(t.n_skip_start + t.n_skip_end)
                .max(1)
        }
        _ => 1,
    }
}

/// Volumes per second in the current mode.
pub fn volume_rate(params: &ScanParameters) -> f64 {
    match (params.mode, &params.z) {
        (ScanningMode::Volumetric, ZParameters::Scanning(z)) => z.frequency,
        (ScanningMode::TriggeredPlanar | ScanningMode::Planar, _) => {
            params.triggering.active_frequency().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

/// Times of the triggered pulses within one volume, seconds from the sweep start.
pub fn pulse_times(params: &ScanParameters) -> Vec<f64> {
    let ZParameters::Scanning(z) = &params.z else {
        return Vec::new();
    };
    let t = &params.triggering;
    if params.mode != ScanningMode::Volumetric || t.n_planes == 0 || !(z.frequency > 0.0) {
        return Vec::new();
    }
    let step = 1.0 / (z.frequency * t.n_planes as f64);
    (t.n_skip_start..t.n_planes.saturating_sub(t.n_skip_end))
        .map(|i| i as f64 * step)
        .collect()
}

/// Piezo positions in `waveform` (one recorded period) at every pulse time.
pub fn piezo_at_pulses(waveform: &[f64], sample_rate: f64, params: &ScanParameters) -> Vec<f64> {
    if waveform.is_empty() {
        return Vec::new();
    }
    pulse_times(params)
        .into_iter()
        .map(|t| waveform[((t * sample_rate).round() as usize) % waveform.len()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanning::parameters::{ZManual, ZScanning};

    fn volumetric(n_planes: usize, skip: usize) -> ScanParameters {
        let mut params = ScanParameters {
            mode: ScanningMode::Volumetric,
            z: ZParameters::Scanning(ZScanning {
                frequency: 10.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        params.triggering.n_planes = n_planes;
        params.triggering.n_skip_start = skip;
        params.triggering.n_skip_end = skip;
        params
    }

    #[test]
    fn test_restart_and_significance() {
        let old = volumetric(10, 1);
        assert!(merits_restart(&old));
        assert!(!merits_restart(&ScanParameters {
            mode: ScanningMode::Planar,
            z: ZParameters::Manual(ZManual::default()),
            ..Default::default()
        }));

        let mut new = old;
        if let ZParameters::Scanning(z) = &mut new.z {
            z.piezo_max = 300.0;
        }
        assert!(!significant_change(&new, &old));
        new.triggering.n_planes = 12;
        assert!(significant_change(&new, &old));
    }

    #[test]
    fn test_effective_n_planes() {
        assert_eq!(effective_n_planes(&volumetric(10, 2)), 6);
        assert_eq!(effective_n_planes(&volumetric(2, 2)), 1);
        assert_eq!(effective_n_planes(&ScanParameters::default()), 1);
    }

    #[test]
    fn test_pulse_times_skip_turnaround() {
        let times = pulse_times(&volumetric(4, 1));
        assert_eq!(times.len(), 2);
        assert!((times[0] - 0.025).abs() < 1e-12);
        assert!((times[1] - 0.05).abs() < 1e-12);
        assert!(pulse_times(&ScanParameters::default()).is_empty());
    }

    #[test]
    fn test_piezo_at_pulses() {
        // 100 samples per volume at 1 kHz, ramp 0..99
        let waveform: Vec<f64> = (0..100).map(f64::from).collect();
        let positions = piezo_at_pulses(&waveform, 1_000.0, &volumetric(4, 0));
        assert_eq!(positions, vec![0.0, 25.0, 50.0, 75.0]);
        assert!(piezo_at_pulses(&[], 1_000.0, &volumetric(4, 0)).is_empty());
    }

    #[test]
    fn test_volume_rate() {
        assert_eq!(volume_rate(&volumetric(4, 0)), 10.0);
        assert_eq!(volume_rate(&ScanParameters::default()), 0.0);
    }
}
