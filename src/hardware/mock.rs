//! Mock Hardware Implementations
//!
//! Simulated scan board and camera for running the whole pipeline without a
//! microscope attached.
//!
//! # Available Mocks
//!
//! - `MockBoardOpener` / `MockBoard` - Simulated scan board with one-tick read-back lag
//! - `MockCamera` - Simulated camera, free-running or triggered by the board
//!
//! # Observing the mocks
//!
//! `MockBoardProbe` is shared between the opener and every session it opens. Tests use
//! it to inspect written ticks and count session opens/teardowns. `TriggerLine` carries
//! the camera trigger pulses from the board to a `MockCamera` in external trigger mode.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::Array2;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{BoardConfig, ChannelRange, ScanningConfig};
use crate::error::HardwareError;
use crate::hardware::capabilities::{
    BoardOpener, FrameSource, OutputArrays, Roi, ScanBoard, ScanChannel, TriggerMode,
};
use crate::hardware::Frame;
use crate::waveforms::CAMERA_PULSE_HIGH;

/// Ticks kept by a probe before the oldest are discarded.
const DEFAULT_TICK_HISTORY: usize = 4096;

// =============================================================================
// TriggerLine - camera trigger wiring
// =============================================================================

/// Counter of rising edges on the camera trigger output.
#[derive(Debug, Clone, Default)]
pub struct TriggerLine(Arc<AtomicU64>);

impl TriggerLine {
    /// New line with no pulses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total pulses emitted so far.
    pub fn pulse_count(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }
}

// =============================================================================
// MockBoardProbe - shared observation point
// =============================================================================

#[derive(Debug, Default)]
struct ProbeState {
    opened: usize,
    closed: usize,
    started: usize,
    writes: usize,
    history: usize,
    ticks: VecDeque<OutputArrays>,
    fault: Option<(usize, HardwareError)>,
}

/// Shared view into every session opened by one [`MockBoardOpener`].
#[derive(Debug, Clone, Default)]
pub struct MockBoardProbe(Arc<Mutex<ProbeState>>);

impl MockBoardProbe {
    fn new(history: usize) -> Self {
        let probe = Self::default();
        probe.0.lock().history = history;
        probe
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.0.lock().opened
    }

    /// Sessions torn down so far.
    pub fn sessions_closed(&self) -> usize {
        self.0.lock().closed
    }

    /// Calls to `start` across all sessions.
    pub fn starts(&self) -> usize {
        self.0.lock().started
    }

    /// Successful writes across all sessions.
    pub fn writes(&self) -> usize {
        self.0.lock().writes
    }

    /// Written ticks, oldest first (bounded history).
    pub fn recorded_ticks(&self) -> Vec<OutputArrays> {
        self.0.lock().ticks.iter().cloned().collect()
    }

    /// The most recently written tick.
    pub fn last_tick(&self) -> Option<OutputArrays> {
        self.0.lock().ticks.back().cloned()
    }

    /// One channel of every recorded tick, concatenated.
    pub fn channel_history(&self, channel: ScanChannel) -> Vec<f64> {
        self.0
            .lock()
            .ticks
            .iter()
            .flat_map(|t| t.get(channel).iter().copied())
            .collect()
    }

    /// Make the write with global index `write_index` (0-based) fail with `error`.
    pub fn inject_fault(&self, write_index: usize, error: HardwareError) {
        self.0.lock().fault = Some((write_index, error));
    }

    fn record_write(&self, outputs: &OutputArrays) -> Result<(), HardwareError> {
        let mut state = self.0.lock();
        if let Some((at, _)) = &state.fault {
            if *at == state.writes {
                if let Some((_, error)) = state.fault.take() {
                    return Err(error);
                }
            }
        }
        state.writes += 1;
        if state.history > 0 {
            if state.ticks.len() == state.history {
                state.ticks.pop_front();
            }
            state.ticks.push_back(outputs.clone());
        }
        Ok(())
    }
}

// =============================================================================
// MockBoard - Simulated Scan Board
// =============================================================================

/// Opens [`MockBoard`] sessions.
///
/// # Example
///
/// ```rust
/// use dslm_daq::hardware::capabilities::BoardOpener;
/// use dslm_daq::hardware::mock::MockBoardOpener;
///
/// let mut opener = MockBoardOpener::new();
/// let probe = opener.probe();
/// let board = opener.open(40_000.0, 1_000).unwrap();
/// drop(board);
/// assert_eq!(probe.sessions_opened(), 1);
/// assert_eq!(probe.sessions_closed(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MockBoardOpener {
    board: BoardConfig,
    piezo_scale: f64,
    realtime: bool,
    tick_delay: Option<Duration>,
    probe: MockBoardProbe,
    trigger_line: TriggerLine,
}

impl MockBoardOpener {
    /// Opener with the default channel layout, no pacing.
    pub fn new() -> Self {
        Self::from_config(&ScanningConfig::default())
    }

    /// Opener using the channel ranges and piezo scale of `config`.
    pub fn from_config(config: &ScanningConfig) -> Self {
        Self {
            board: config.board.clone(),
            piezo_scale: config.piezo_scale,
            realtime: false,
            tick_delay: None,
            probe: MockBoardProbe::new(DEFAULT_TICK_HISTORY),
            trigger_line: TriggerLine::new(),
        }
    }

    /// Pace `read` to the sample clock (`n_samples / sample_rate` per tick).
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Sleep a fixed time in every `read`.
    pub fn with_tick_delay(mut self, delay: Duration) -> Self {
        self.tick_delay = Some(delay);
        self
    }

    /// Keep at most `ticks` written ticks in the probe (0 disables recording).
    pub fn with_tick_history(mut self, ticks: usize) -> Self {
        self.probe.0.lock().history = ticks;
        self
    }

    /// Shared probe observing every session.
    pub fn probe(&self) -> MockBoardProbe {
        self.probe.clone()
    }

    /// Trigger line fed by every session's camera trigger channel.
    pub fn trigger_line(&self) -> TriggerLine {
        self.trigger_line.clone()
    }
}

impl Default for MockBoardOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardOpener for MockBoardOpener {
    fn open(
        &mut self,
        sample_rate: f64,
        n_samples: usize,
    ) -> Result<Box<dyn ScanBoard>, HardwareError> {
        if !(sample_rate > 0.0) || n_samples == 0 {
            return Err(HardwareError::Configuration(format!(
                "cannot clock {n_samples} samples per tick at {sample_rate} Hz"
            )));
        }
        let pacing = if self.realtime {
            Some(Duration::from_secs_f64(n_samples as f64 / sample_rate))
        } else {
            self.tick_delay
        };
        self.probe.0.lock().opened += 1;
        tracing::debug!(sample_rate, n_samples, "mock board session opened");

        Ok(Box::new(MockBoard {
            n_samples,
            board: self.board.clone(),
            piezo_scale: self.piezo_scale,
            pacing,
            outputs: OutputArrays::new(n_samples),
            previous_piezo: vec![0.0; n_samples],
            last_written_piezo: vec![0.0; n_samples],
            readback: vec![0.0; n_samples],
            trigger_high: false,
            started: false,
            probe: self.probe.clone(),
            trigger_line: self.trigger_line.clone(),
        }))
    }
}

/// Simulated board session.
///
/// The piezo read-back returns the piezo command written one tick earlier, which is
/// the lag a real board shows between its output and input tasks. Written voltages are
/// checked against the configured channel ranges like the driver would.
#[derive(Debug)]
pub struct MockBoard {
    n_samples: usize,
    board: BoardConfig,
    piezo_scale: f64,
    pacing: Option<Duration>,
    outputs: OutputArrays,
    previous_piezo: Vec<f64>,
    last_written_piezo: Vec<f64>,
    readback: Vec<f64>,
    trigger_high: bool,
    started: bool,
    probe: MockBoardProbe,
    trigger_line: TriggerLine,
}

fn check_range(range: &ChannelRange, name: &str, values: &[f64]) -> Result<(), HardwareError> {
    match values
        .iter()
        .find(|&&v| v < range.min_val || v > range.max_val)
    {
        Some(v) => Err(HardwareError::Configuration(format!(
            "{name} sample {v} V outside [{}, {}] on {}",
            range.min_val, range.max_val, range.channel
        ))),
        None => Ok(()),
    }
}

impl MockBoard {
    fn check_ranges(&self) -> Result<(), HardwareError> {
        let piezo_volts: Vec<f64> = self
            .outputs
            .get(ScanChannel::ZPiezo)
            .iter()
            .map(|p| p * self.piezo_scale)
            .collect();
        check_range(&self.board.z_write, "piezo", &piezo_volts)?;
        for (channel, name) in [
            (ScanChannel::ZLateral, "z lateral"),
            (ScanChannel::ZFrontal, "z frontal"),
            (ScanChannel::CameraTrigger, "camera trigger"),
        ] {
            check_range(&self.board.z_write, name, self.outputs.get(channel))?;
        }
        for (channel, name) in [
            (ScanChannel::XyLateral, "xy lateral"),
            (ScanChannel::XyFrontal, "xy frontal"),
        ] {
            check_range(&self.board.xy_write, name, self.outputs.get(channel))?;
        }
        Ok(())
    }

    fn count_rising_edges(&mut self) -> u64 {
        let threshold = CAMERA_PULSE_HIGH / 2.0;
        let mut edges = 0;
        for &v in self.outputs.get(ScanChannel::CameraTrigger) {
            let high = v > threshold;
            if high && !self.trigger_high {
                edges += 1;
            }
            self.trigger_high = high;
        }
        edges
    }
}

impl ScanBoard for MockBoard {
    fn n_samples(&self) -> usize {
        self.n_samples
    }

    fn outputs(&self) -> &OutputArrays {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut OutputArrays {
        &mut self.outputs
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        if !self.started {
            self.started = true;
            self.probe.0.lock().started += 1;
        }
        Ok(())
    }

    fn write(&mut self) -> Result<(), HardwareError> {
        self.check_ranges()?;
        self.probe.record_write(&self.outputs)?;
        let edges = self.count_rising_edges();
        if edges > 0 {
            self.trigger_line.add(edges);
        }
        self.last_written_piezo
            .copy_from_slice(self.outputs.get(ScanChannel::ZPiezo));
        Ok(())
    }

    fn read(&mut self) -> Result<(), HardwareError> {
        if !self.started {
            return Err(HardwareError::Timing {
                channel: self.board.z_read.channel.clone(),
                message: "read before the tasks were started".to_string(),
            });
        }
        if let Some(delay) = self.pacing {
            std::thread::sleep(delay);
        }
        self.readback.copy_from_slice(&self.previous_piezo);
        self.previous_piezo.copy_from_slice(&self.last_written_piezo);
        Ok(())
    }

    fn piezo_readback(&self) -> &[f64] {
        &self.readback
    }
}

impl Drop for MockBoard {
    fn drop(&mut self) {
        self.probe.0.lock().closed += 1;
        tracing::debug!("mock board session closed");
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera producing noise frames.
///
/// Simulates a camera with:
/// - A fixed sensor resolution, square binning and a sensor-pixel ROI
/// - Free-running frames at one per exposure time
/// - Externally triggered frames, one per pulse on an attached [`TriggerLine`]
///
/// The first pixel of every frame holds the frame's sequence number (wrapping), so
/// tests can check frame order after volume assembly.
#[derive(Debug)]
pub struct MockCamera {
    sensor: (usize, usize),
    binning: usize,
    roi: Option<Roi>,
    exposure: Duration,
    trigger_mode: TriggerMode,
    trigger_line: Option<TriggerLine>,
    pulses_seen: u64,
    acquiring: bool,
    last_frame: Option<Instant>,
    base: Frame,
    rng: StdRng,
    sequence: u64,
}

impl MockCamera {
    /// Camera with a `(height, width)` sensor, binning 1, 60 ms exposure.
    pub fn new(sensor_resolution: (usize, usize)) -> Self {
        let mut camera = Self {
            sensor: sensor_resolution,
            binning: 1,
            roi: None,
            exposure: Duration::from_millis(60),
            trigger_mode: TriggerMode::Free,
            trigger_line: None,
            pulses_seen: 0,
            acquiring: false,
            last_frame: None,
            base: Array2::zeros((0, 0)),
            rng: StdRng::seed_from_u64(0x5EED),
            sequence: 0,
        };
        camera.prepare_image();
        camera
    }

    /// Attach the board's camera trigger line.
    pub fn with_trigger_line(mut self, line: TriggerLine) -> Self {
        self.pulses_seen = line.pulse_count();
        self.trigger_line = Some(line);
        self
    }

    /// Frames produced since creation.
    pub fn frames_produced(&self) -> u64 {
        self.sequence
    }

    fn prepare_image(&mut self) {
        let (h, w) = self.frame_shape();
        let rng = &mut self.rng;
        self.base = Array2::from_shape_simple_fn((h, w), || rng.gen_range(0..1000u16));
    }

    fn next_frame(&mut self) -> Frame {
        let multiplier: u16 = self.rng.gen_range(1..5);
        let mut frame = self.base.mapv(|v| v.saturating_mul(multiplier));
        if let Some(first) = frame.iter_mut().next() {
            *first = self.sequence as u16;
        }
        self.sequence += 1;
        frame
    }

    fn ensure_stopped(&self, setting: &str) -> Result<(), HardwareError> {
        if self.acquiring {
            return Err(HardwareError::Configuration(format!(
                "cannot change {setting} while acquiring"
            )));
        }
        Ok(())
    }
}

impl FrameSource for MockCamera {
    fn get_frames(&mut self) -> Result<Vec<Frame>, HardwareError> {
        if !self.acquiring {
            return Ok(Vec::new());
        }

        let n_frames = match (&self.trigger_mode, &self.trigger_line) {
            (TriggerMode::ExternalTrigger, Some(line)) => {
                let count = line.pulse_count();
                let n = count.saturating_sub(self.pulses_seen);
                self.pulses_seen = count;
                n as usize
            }
            _ => {
                let now = Instant::now();
                match self.last_frame {
                    Some(last) if now.duration_since(last) >= self.exposure => {
                        self.last_frame = Some(now);
                        1
                    }
                    Some(_) => 0,
                    None => {
                        self.last_frame = Some(now);
                        0
                    }
                }
            }
        };

        Ok((0..n_frames).map(|_| self.next_frame()).collect())
    }

    fn start_acquisition(&mut self) -> Result<(), HardwareError> {
        self.acquiring = true;
        self.last_frame = None;
        if let Some(line) = &self.trigger_line {
            self.pulses_seen = line.pulse_count();
        }
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), HardwareError> {
        self.acquiring = false;
        Ok(())
    }

    fn set_exposure_time(&mut self, exposure_ms: f64) -> Result<(), HardwareError> {
        self.ensure_stopped("exposure")?;
        if !(exposure_ms > 0.0) {
            return Err(HardwareError::Configuration(format!(
                "exposure must be positive, got {exposure_ms} ms"
            )));
        }
        self.exposure = Duration::from_secs_f64(exposure_ms * 1e-3);
        Ok(())
    }

    fn set_binning(&mut self, binning: usize) -> Result<(), HardwareError> {
        self.ensure_stopped("binning")?;
        if binning == 0 {
            return Err(HardwareError::Configuration("binning must be at least 1".into()));
        }
        self.binning = binning;
        self.prepare_image();
        Ok(())
    }

    fn set_roi(&mut self, roi: Option<Roi>) -> Result<(), HardwareError> {
        self.ensure_stopped("roi")?;
        if let Some(r) = roi {
            if r.y + r.height > self.sensor.0 || r.x + r.width > self.sensor.1 {
                return Err(HardwareError::Configuration(format!(
                    "roi {r:?} exceeds sensor {:?}",
                    self.sensor
                )));
            }
        }
        self.roi = roi;
        self.prepare_image();
        Ok(())
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), HardwareError> {
        self.ensure_stopped("trigger mode")?;
        self.trigger_mode = mode;
        Ok(())
    }

    fn frame_shape(&self) -> (usize, usize) {
        let (h, w) = match self.roi {
            Some(r) => (r.height, r.width),
            None => self.sensor,
        };
        (h / self.binning, w / self.binning)
    }
}
