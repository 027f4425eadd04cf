//! Hardware Capabilities
//!
//! The scanning core talks to hardware through two small capability traits:
//!
//! - [`ScanBoard`]: synchronized analog output/input, one tick of samples at a time
//! - [`FrameSource`]: a camera delivering 2D frames
//!
//! plus [`BoardOpener`], which opens a fresh board session. Sessions are RAII-scoped:
//! dropping the `Box<dyn ScanBoard>` tears the hardware tasks down, so a scan loop that
//! exits by any path (return, error, restart) releases its board.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is blocking (workers run on dedicated OS threads polling every millisecond)
//! - Is `Send`, so a session can be moved into the worker that owns it
//! - Reports faults as [`HardwareError`]
//! - Focuses on ONE device
//!
//! # Example
//!
//! ```rust
//! use dslm_daq::hardware::capabilities::{BoardOpener, ScanChannel};
//! use dslm_daq::hardware::mock::MockBoardOpener;
//!
//! # fn main() -> Result<(), dslm_daq::error::HardwareError> {
//! let mut opener = MockBoardOpener::new();
//! let mut board = opener.open(40_000.0, 100)?;
//! board.set_channel(ScanChannel::ZPiezo, &[200.0; 100]);
//! board.write()?;
//! board.start()?;
//! board.read()?;
//! assert_eq!(board.piezo_readback().len(), 100);
//! # Ok(())
//! # }
//! ```

use crate::error::HardwareError;
use crate::hardware::Frame;
use serde::{Deserialize, Serialize};

/// Output channels driven every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanChannel {
    /// Piezo position, micrometers
    ZPiezo,
    /// Lateral z galvo, volts
    ZLateral,
    /// Frontal z galvo, volts
    ZFrontal,
    /// Camera trigger line, volts
    CameraTrigger,
    /// Lateral xy galvo, volts
    XyLateral,
    /// Frontal xy galvo, volts
    XyFrontal,
}

impl ScanChannel {
    /// Every channel, in board order.
    pub const ALL: [ScanChannel; 6] = [
        ScanChannel::ZPiezo,
        ScanChannel::ZLateral,
        ScanChannel::ZFrontal,
        ScanChannel::CameraTrigger,
        ScanChannel::XyLateral,
        ScanChannel::XyFrontal,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// One tick of output samples for every [`ScanChannel`].
///
/// Board backends embed this and hand it out through [`ScanBoard::outputs`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputArrays {
    n_samples: usize,
    channels: [Vec<f64>; 6],
}

impl OutputArrays {
    /// Zeroed arrays of `n_samples` per channel.
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            channels: std::array::from_fn(|_| vec![0.0; n_samples]),
        }
    }

    /// Samples per channel.
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Samples of one channel.
    pub fn get(&self, channel: ScanChannel) -> &[f64] {
        &self.channels[channel.index()]
    }

    /// Overwrite a channel with `values`.
    ///
    /// Only the first `n_samples` values are used; a shorter slice leaves the tail of
    /// the channel untouched.
    pub fn set(&mut self, channel: ScanChannel, values: &[f64]) {
        let n = values.len().min(self.n_samples);
        self.channels[channel.index()][..n].copy_from_slice(&values[..n]);
    }

    /// Set a whole channel to one value.
    pub fn fill(&mut self, channel: ScanChannel, value: f64) {
        self.channels[channel.index()].fill(value);
    }
}

/// Capability: Synchronized Analog Scanning
///
/// A board session driving the piezo, galvos and camera trigger on one shared sample
/// clock, and reading back the piezo position.
///
/// # Contract
/// - Every channel holds exactly [`n_samples`](ScanBoard::n_samples) samples per tick
/// - `write` queues the current output arrays; `read` blocks until one tick of input
///   is available
/// - `start` arms the timed tasks; it is called once, after the first `write`
/// - The piezo read-back lags the output by one tick
/// - Dropping the session releases the hardware
pub trait ScanBoard: Send {
    /// Samples per channel per tick.
    fn n_samples(&self) -> usize;

    /// Output arrays of the current tick.
    fn outputs(&self) -> &OutputArrays;

    /// Mutable output arrays of the current tick.
    fn outputs_mut(&mut self) -> &mut OutputArrays;

    /// Arm the synchronized timed I/O.
    fn start(&mut self) -> Result<(), HardwareError>;

    /// Push the current output arrays to the hardware.
    fn write(&mut self) -> Result<(), HardwareError>;

    /// Pull one tick of piezo position feedback.
    fn read(&mut self) -> Result<(), HardwareError>;

    /// Piezo position read by the last [`read`](ScanBoard::read), micrometers.
    fn piezo_readback(&self) -> &[f64];

    /// Samples of one output channel.
    fn channel(&self, channel: ScanChannel) -> &[f64] {
        self.outputs().get(channel)
    }

    /// Overwrite one output channel.
    fn set_channel(&mut self, channel: ScanChannel, values: &[f64]) {
        self.outputs_mut().set(channel, values);
    }

    /// Set one output channel to a constant.
    fn fill_channel(&mut self, channel: ScanChannel, value: f64) {
        self.outputs_mut().fill(channel, value);
    }

    /// Piezo command, micrometers.
    fn set_z_piezo(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::ZPiezo, values);
    }

    /// Lateral z galvo command.
    fn set_z_lateral(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::ZLateral, values);
    }

    /// Frontal z galvo command.
    fn set_z_frontal(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::ZFrontal, values);
    }

    /// Camera trigger pulses.
    fn set_camera_trigger(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::CameraTrigger, values);
    }

    /// Lateral xy galvo command.
    fn set_xy_lateral(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::XyLateral, values);
    }

    /// Frontal xy galvo command.
    fn set_xy_frontal(&mut self, values: &[f64]) {
        self.set_channel(ScanChannel::XyFrontal, values);
    }
}

/// Opens board sessions.
///
/// The scanner opens a new session every time it (re)enters an active scan mode, since
/// timing configuration cannot be changed on running hardware tasks.
pub trait BoardOpener: Send {
    /// Configure and open a session clocked at `sample_rate` with `n_samples` per tick.
    fn open(
        &mut self,
        sample_rate: f64,
        n_samples: usize,
    ) -> Result<Box<dyn ScanBoard>, HardwareError>;
}

/// Region of interest in sensor pixels, applied before binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First row
    pub y: usize,
    /// First column
    pub x: usize,
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
}

/// How frames are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Free-running at the exposure-limited rate
    #[default]
    Free,
    /// One frame per pulse on the camera trigger line
    ExternalTrigger,
}

/// Capability: Frame Acquisition
///
/// A camera as seen by the acquisition loop. Vendor protocols live behind this trait.
///
/// # Contract
/// - `get_frames` never blocks for long; it returns every frame completed since the
///   last call, possibly none
/// - Settings may be changed only while acquisition is stopped
pub trait FrameSource: Send {
    /// Frames completed since the last call.
    fn get_frames(&mut self) -> Result<Vec<Frame>, HardwareError>;

    /// Begin acquiring.
    fn start_acquisition(&mut self) -> Result<(), HardwareError>;

    /// Stop acquiring.
    fn stop_acquisition(&mut self) -> Result<(), HardwareError>;

    /// Exposure time, milliseconds.
    fn set_exposure_time(&mut self, exposure_ms: f64) -> Result<(), HardwareError>;

    /// Square pixel binning factor.
    fn set_binning(&mut self, binning: usize) -> Result<(), HardwareError>;

    /// Region of interest; `None` selects the full sensor.
    fn set_roi(&mut self, roi: Option<Roi>) -> Result<(), HardwareError>;

    /// Frame start mode.
    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), HardwareError>;

    /// Shape `(height, width)` of the frames currently produced.
    fn frame_shape(&self) -> (usize, usize);

    /// Release the device.
    fn shutdown(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}
