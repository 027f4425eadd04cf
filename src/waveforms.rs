//! Analog waveform generators.
//!
//! Every generator is a pure function of an absolute time vector in seconds and returns
//! a sample vector of the same length. Scan loops build the time vector from the
//! absolute sample counter (see [`time_vector`]) so consecutive ticks join without
//! phase jumps.

/// Voltage of a camera trigger pulse.
pub const CAMERA_PULSE_HIGH: f64 = 5.0;

/// A waveform evaluated at absolute times.
pub trait Waveform {
    /// Sample values at each time in `t` (seconds).
    fn values(&self, t: &[f64]) -> Vec<f64>;
}

#[inline]
fn frac(x: f64) -> f64 {
    x - x.floor()
}

/// Constant output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantWaveform {
    /// Output value
    pub value: f64,
}

impl ConstantWaveform {
    /// Create a constant waveform.
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl Waveform for ConstantWaveform {
    fn values(&self, t: &[f64]) -> Vec<f64> {
        vec![self.value; t.len()]
    }
}

/// Linear ramp from `vmin` to `vmax`, resetting every period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SawtoothWaveform {
    /// Frequency in Hz
    pub frequency: f64,
    /// Value at the start of each period
    pub vmin: f64,
    /// Value approached at the end of each period
    pub vmax: f64,
}

impl SawtoothWaveform {
    /// Create a sawtooth.
    pub fn new(frequency: f64, vmin: f64, vmax: f64) -> Self {
        Self {
            frequency,
            vmin,
            vmax,
        }
    }
}

impl Waveform for SawtoothWaveform {
    fn values(&self, t: &[f64]) -> Vec<f64> {
        t.iter()
            .map(|&ti| frac(ti * self.frequency) * (self.vmax - self.vmin) + self.vmin)
            .collect()
    }
}

/// Symmetric triangle between `vmin` and `vmax`.
///
/// With zero phase the wave starts at `vmin` and peaks at `vmax` half a period later.
/// `phase` shifts the wave by a fraction of a period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleWaveform {
    /// Frequency in Hz
    pub frequency: f64,
    /// Minimum value
    pub vmin: f64,
    /// Maximum value
    pub vmax: f64,
    /// Phase offset in periods
    pub phase: f64,
}

impl TriangleWaveform {
    /// Create a zero-phase triangle.
    pub fn new(frequency: f64, vmin: f64, vmax: f64) -> Self {
        Self {
            frequency,
            vmin,
            vmax,
            phase: 0.0,
        }
    }

    /// Shift by `phase` periods.
    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }
}

impl Waveform for TriangleWaveform {
    fn values(&self, t: &[f64]) -> Vec<f64> {
        let amplitude = self.vmax - self.vmin;
        t.iter()
            .map(|&ti| {
                let tf = ti * self.frequency + self.phase;
                self.vmin + amplitude / 2.0 + amplitude * ((frac(tf + 0.5) - 0.5).abs() - 0.25) * 2.0
            })
            .collect()
    }
}

/// Two-level wave that sits at `vmax` near the zero crossings of a sine and at `vmin`
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegativeStepWaveform {
    /// Frequency in Hz
    pub frequency: f64,
    /// Low level
    pub vmin: f64,
    /// High level
    pub vmax: f64,
    /// Width of the high window, in units of `|sin|`
    pub threshold: f64,
}

impl Waveform for NegativeStepWaveform {
    fn values(&self, t: &[f64]) -> Vec<f64> {
        t.iter()
            .map(|&ti| {
                let s = (ti * self.frequency * 2.0 * std::f64::consts::PI - std::f64::consts::FRAC_PI_2).sin();
                if s.abs() < self.threshold {
                    self.vmax
                } else {
                    self.vmin
                }
            })
            .collect()
    }
}

/// Absolute times of `n` samples starting at sample index `start`.
pub fn time_vector(start: usize, n: usize, sample_rate: f64) -> Vec<f64> {
    (start..start + n).map(|i| i as f64 / sample_rate).collect()
}

/// Zero `buffer`, then place `high` at `n_planes` evenly spaced slots, skipping the
/// first `n_skip_start` and last `n_skip_end`.
///
/// Slot `i` sits at `i * round(len / n_planes)`. Slots that would fall past the end of
/// the buffer are not placed.
pub fn set_impulses(
    buffer: &mut [f64],
    n_planes: usize,
    n_skip_start: usize,
    n_skip_end: usize,
    high: f64,
) {
    buffer.fill(0.0);
    if n_planes == 0 || buffer.is_empty() {
        return;
    }
    let n_between = (buffer.len() as f64 / n_planes as f64).round() as usize;
    for i in n_skip_start..n_planes.saturating_sub(n_skip_end) {
        if let Some(slot) = buffer.get_mut(i * n_between) {
            *slot = high;
        }
    }
}

/// Greatest common divisor.
pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple; zero if either argument is zero.
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}
