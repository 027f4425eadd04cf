//! Camera frames to assembled volumes.
//!
//! - [`camera`]: pumps frames from a [`FrameSource`](crate::hardware::FrameSource) into
//!   the camera queue
//! - [`dispatcher`]: stacks frames into volumes for the viewer and the saver

pub mod camera;
pub mod dispatcher;

pub use camera::{run_camera, spawn_camera, CameraContext, CameraMode, CameraParameters, CameraStats, FramerateRecorder};
pub use dispatcher::{
    neg_dif, run_dispatcher, spawn_dispatcher, DispatcherContext, DispatcherOutputs,
    DispatcherSignals, DispatcherStats, VolumeDispatcher,
};
