//! Galvo and piezo scanning.
//!
//! - [`parameters`]: the per-tick scan configuration
//! - [`scan_loop`]: one board session ticking in one mode
//! - [`trigger`]: the camera trigger gate
//! - [`scanner`]: the worker reopening sessions across modes and faults
//! - [`calibration`] and [`manager`]: operator-side helpers

pub mod calibration;
pub mod manager;
pub mod parameters;
pub mod scan_loop;
pub mod scanner;
pub mod trigger;

pub use calibration::{Calibration, CalibrationPoint, GalvoCalibration};
pub use parameters::{
    PlanarScanning, ScanParameters, ScanningMode, SyncCoefficients, TriggeringParameters,
    XyScanning, ZManual, ZParameters, ZScanning, ZSynced,
};
pub use scan_loop::{LoopExit, ScanLoop, ScanLoopIo, ScanSignals, SAFE_GALVO_RANGE};
pub use scanner::{run_scanner, spawn_scanner, ScannerContext, ScannerStats};
pub use trigger::{CameraTrigger, GateState};
