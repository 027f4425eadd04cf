//! Hardware boundary: capability traits and their simulated implementations.

pub mod capabilities;
pub mod mock;

use ndarray::{Array2, Array3};

/// One camera frame, `[height, width]`.
pub type Frame = Array2<u16>;

/// One assembled volume, `[n_planes, height, width]`.
pub type Volume = Array3<u16>;

pub use capabilities::{BoardOpener, FrameSource, Roi, ScanBoard, ScanChannel, TriggerMode};
pub use mock::{MockBoardOpener, MockBoardProbe, MockCamera, TriggerLine};
