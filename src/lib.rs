//! # DSLM DAQ Core Library
//!
//! Real-time core of a digital scanned light-sheet microscope: it generates the
//! galvo, piezo and camera trigger waveforms, assembles camera frames into volumes,
//! and streams volumes to chunked datasets on disk. The `dslm` binary drives it with
//! simulated hardware; instrument frontends use [`pipeline::Microscope`].
//!
//! ## Crate Structure
//!
//! - **`scanning`**: scan parameters, the tick-based scan loop, camera trigger gating,
//!   the scanner worker and piezo calibration.
//! - **`acquisition`**: the camera worker and the volume dispatcher.
//! - **`data`**: the rolling sample buffer, the chunk file codec and the streaming saver.
//! - **`hardware`**: blocking capability traits for the scan board and camera, plus
//!   simulated implementations.
//! - **`pipeline`**: queue/flag wiring of all workers and the operator operations.
//! - **`waveforms`**: pure waveform generators.
//! - **`queue`** and **`events`**: inter-worker queue helpers, shared flags and the
//!   per-worker concurrence log.
//! - **`config`**, **`error`**, **`tracing_setup`**: layered configuration, the crate
//!   error type and logging setup.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod hardware;
pub mod pipeline;
pub mod queue;
pub mod scanning;
pub mod tracing_setup;
pub mod waveforms;
