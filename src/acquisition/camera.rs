//! Camera frame pump.
//!
//! `run_camera` moves frames from a [`FrameSource`] into the bounded camera queue.
//! A full queue blocks the pump rather than dropping frames: the dispatcher counts
//! planes by arrival, so a lost frame would shift every later volume by one plane.
//! Parameter updates are drained to the newest value on every pass; applying them stops
//! and restarts acquisition since most sensors refuse setting changes while running.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;
use crate::error::{AppResult, DslmError, HardwareError};
use crate::events::{ConcurrenceLog, LoggedFlag};
use crate::hardware::capabilities::{FrameSource, Roi, TriggerMode};
use crate::hardware::Frame;
use crate::queue::{recv_latest_timeout, send_until, LatestQueue};

/// Whether the camera should acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    /// Acquisition stopped
    #[default]
    Paused,
    /// Acquiring
    Preview,
}

/// Settings applied to the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Exposure time, milliseconds
    pub exposure_ms: f64,
    /// Square binning factor
    pub binning: usize,
    /// Sensor region, full sensor when `None`
    pub roi: Option<Roi>,
    /// Free running or externally triggered
    pub trigger_mode: TriggerMode,
    /// Acquire or idle
    pub mode: CameraMode,
}

impl CameraParameters {
    /// Paused parameters with the configured startup exposure and binning.
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            exposure_ms: config.default_exposure_ms,
            binning: config.default_binning,
            roi: None,
            trigger_mode: TriggerMode::Free,
            mode: CameraMode::Paused,
        }
    }
}

/// Frame rate estimate over blocks of `n_fps_frames` frames.
#[derive(Debug, Clone)]
pub struct FramerateRecorder {
    n_fps_frames: usize,
    i_fps: usize,
    previous: Option<Instant>,
    current: Option<f64>,
}

impl FramerateRecorder {
    /// Recorder reporting once every `n_fps_frames` frames (at least 1).
    pub fn new(n_fps_frames: usize) -> Self {
        Self {
            n_fps_frames: n_fps_frames.max(1),
            i_fps: 0,
            previous: None,
            current: None,
        }
    }

    /// Most recent estimate, frames per second.
    pub fn current(&self) -> Option<f64> {
        self.current
    }

    /// Count one frame received at `now`.
    ///
    /// Returns `Some(estimate)` at the end of every block. The estimate itself is `None`
    /// until two block ends have been seen since the last [`restart`](Self::restart).
    pub fn update(&mut self, now: Instant) -> Option<Option<f64>> {
        let mut report = None;
        if self.i_fps == self.n_fps_frames - 1 {
            if let Some(previous) = self.previous {
                let elapsed = now.duration_since(previous).as_secs_f64();
                self.current = Some(if elapsed > 0.0 {
                    self.n_fps_frames as f64 / elapsed
                } else {
                    0.0
                });
            }
            self.previous = Some(now);
            report = Some(self.current);
        }
        self.i_fps = (self.i_fps + 1) % self.n_fps_frames;
        report
    }

    /// Forget the estimate after a settings change.
    pub fn restart(&mut self) {
        self.current = None;
        self.previous = None;
        self.i_fps = 0;
    }
}

/// Everything the camera thread owns.
pub struct CameraContext {
    /// The sensor
    pub camera: Box<dyn FrameSource>,
    /// Incoming parameters
    pub parameters: Receiver<CameraParameters>,
    /// Raw frames to the dispatcher
    pub frames: Sender<Frame>,
    /// Frame rate estimates
    pub frame_rate: LatestQueue<f64>,
    /// Shared shutdown
    pub stop: LoggedFlag,
    /// Camera concurrence log
    pub log: Arc<ConcurrenceLog>,
    /// Startup parameters
    pub initial: CameraParameters,
    /// Frames per frame-rate estimate
    pub n_fps_frames: usize,
    /// Poll timeout
    pub poll_timeout: Duration,
}

impl std::fmt::Debug for CameraContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraContext")
            .field("initial", &self.initial)
            .field("n_fps_frames", &self.n_fps_frames)
            .finish_non_exhaustive()
    }
}

/// Counters reported when the camera worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraStats {
    /// Frames forwarded to the dispatcher
    pub frames: u64,
    /// Frames discarded because shutdown began while the camera queue was full
    pub dropped: u64,
    /// Frame source errors
    pub errors: u64,
}

struct CameraWorker {
    camera: Box<dyn FrameSource>,
    parameters: CameraParameters,
    recorder: FramerateRecorder,
    log: Arc<ConcurrenceLog>,
    stats: CameraStats,
}

impl CameraWorker {
    fn apply(&mut self, new: CameraParameters, stop_start: bool) {
        self.parameters = new;
        if stop_start {
            let stopped = self.camera.stop_acquisition();
            self.report(stopped);
        }
        let result = self
            .camera
            .set_binning(new.binning)
            .and_then(|()| self.camera.set_roi(new.roi))
            .and_then(|()| self.camera.set_exposure_time(new.exposure_ms))
            .and_then(|()| self.camera.set_trigger_mode(new.trigger_mode));
        self.report(result);
        if stop_start {
            let started = self.camera.start_acquisition();
            self.report(started);
        }
        self.recorder.restart();
        self.log.log_message("updated parameters");
        tracing::debug!(parameters = ?new, frame_shape = ?self.camera.frame_shape(), "camera parameters applied");
    }

    fn report(&mut self, result: Result<(), HardwareError>) {
        if let Err(e) = result {
            self.stats.errors += 1;
            tracing::warn!(error = %e, "camera error");
        }
    }
}

/// Run the camera pump until the stop flag is set.
pub fn run_camera(ctx: CameraContext) -> CameraStats {
    let CameraContext {
        camera,
        parameters: rx,
        frames,
        frame_rate,
        stop,
        log,
        initial,
        n_fps_frames,
        poll_timeout,
    } = ctx;

    let mut worker = CameraWorker {
        camera,
        parameters: initial,
        recorder: FramerateRecorder::new(n_fps_frames),
        log,
        stats: CameraStats::default(),
    };
    worker.log.log_message("started");
    worker.apply(initial, false);
    tracing::info!("camera started");

    while !stop.is_set() {
        if worker.parameters.mode == CameraMode::Paused {
            if let Some(new) = recv_latest_timeout(&rx, poll_timeout) {
                worker.log.log_queue("camera_parameters", false);
                if new != worker.parameters {
                    worker.apply(new, false);
                }
            }
            continue;
        }

        let started = worker.camera.start_acquisition();
        worker.report(started);
        worker.log.log_message("started acquisition");

        while !stop.is_set() {
            match worker.camera.get_frames() {
                Ok(batch) => {
                    for frame in batch {
                        if send_until(&frames, frame, poll_timeout, || stop.is_set()) {
                            worker.stats.frames += 1;
                        } else {
                            worker.stats.dropped += 1;
                        }
                        if let Some(Some(fps)) = worker.recorder.update(Instant::now()) {
                            frame_rate.publish(fps);
                        }
                    }
                }
                Err(e) => worker.report(Err(e)),
            }

            if let Some(new) = recv_latest_timeout(&rx, poll_timeout) {
                worker.log.log_queue("camera_parameters", false);
                if new.mode == CameraMode::Paused {
                    let stopped = worker.camera.stop_acquisition();
                    worker.report(stopped);
                    worker.apply(new, false);
                    worker.log.log_message("paused");
                    break;
                }
                if new != worker.parameters {
                    worker.apply(new, true);
                }
            }
        }
    }

    let stopped = worker.camera.stop_acquisition();
    worker.report(stopped);
    let shutdown = worker.camera.shutdown();
    worker.report(shutdown);
    worker.log.log_message("stopped");
    worker.log.flush();
    tracing::info!(stats = ?worker.stats, "camera stopped");
    worker.stats
}

/// Spawn [`run_camera`] on a named thread.
pub fn spawn_camera(ctx: CameraContext) -> AppResult<JoinHandle<CameraStats>> {
    thread::Builder::new()
        .name("camera".to_string())
        .spawn(move || run_camera(ctx))
        .map_err(|e| DslmError::Worker(format!("failed to spawn camera: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DslmEvent;
    use crate::hardware::mock::MockCamera;
    use crossbeam_channel::{bounded, unbounded};

    #[test]
    fn test_framerate_recorder_blocks() {
        let t0 = Instant::now();
        let mut recorder = FramerateRecorder::new(4);
        for i in 0..3 {
            assert_eq!(recorder.update(t0 + Duration::from_millis(i * 10)), None);
        }
        // first block end: no previous timestamp yet
        assert_eq!(recorder.update(t0 + Duration::from_millis(30)), Some(None));
        for i in 4..7 {
            assert_eq!(recorder.update(t0 + Duration::from_millis(i * 10)), None);
        }
        // 4 frames in 400 ms
        let fps = recorder.update(t0 + Duration::from_millis(430)).unwrap().unwrap();
        assert!((fps - 10.0).abs() < 1e-9);
        assert_eq!(recorder.current(), Some(fps));

        recorder.restart();
        assert_eq!(recorder.current(), None);
    }

    #[test]
    fn test_pumps_frames_and_pauses() {
        let log = ConcurrenceLog::disabled("camera");
        let stop = LoggedFlag::new(DslmEvent::CloseAll, log.clone());
        let (params_tx, params_rx) = unbounded();
        let (frames_tx, frames_rx) = bounded(64);
        let frame_rate = LatestQueue::new(2);
        let initial = CameraParameters {
            exposure_ms: 1.0,
            binning: 2,
            roi: None,
            trigger_mode: TriggerMode::Free,
            mode: CameraMode::Paused,
        };
        let ctx = CameraContext {
            camera: Box::new(MockCamera::new((16, 8))),
            parameters: params_rx,
            frames: frames_tx,
            frame_rate: frame_rate.clone(),
            stop: stop.new_reference(log.clone()),
            log,
            initial,
            n_fps_frames: 2,
            poll_timeout: Duration::from_millis(1),
        };
        let handle = spawn_camera(ctx).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(frames_rx.is_empty());

        params_tx
            .send(CameraParameters {
                mode: CameraMode::Preview,
                ..initial
            })
            .unwrap();
        let frame = frames_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.dim(), (8, 4));

        params_tx.send(initial).unwrap();
        thread::sleep(Duration::from_millis(30));
        while frames_rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(20));
        assert!(frames_rx.is_empty());

        stop.set();
        let stats = handle.join().unwrap();
        assert!(stats.frames >= 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_full_queue_holds_frames_back() {
        let log = ConcurrenceLog::disabled("camera");
        let stop = LoggedFlag::new(DslmEvent::CloseAll, log.clone());
        let (_params_tx, params_rx) = unbounded();
        let (frames_tx, frames_rx) = bounded(1);
        let ctx = CameraContext {
            camera: Box::new(MockCamera::new((4, 4))),
            parameters: params_rx,
            frames: frames_tx,
            frame_rate: LatestQueue::new(1),
            stop: stop.new_reference(log.clone()),
            log,
            initial: CameraParameters {
                exposure_ms: 1.0,
                binning: 1,
                roi: None,
                trigger_mode: TriggerMode::Free,
                mode: CameraMode::Preview,
            },
            n_fps_frames: 10,
            poll_timeout: Duration::from_millis(1),
        };
        let handle = spawn_camera(ctx).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && !frames_rx.is_full() {
            thread::sleep(Duration::from_millis(1));
        }
        // consumer stalls long enough for several exposures
        thread::sleep(Duration::from_millis(30));

        let sequence: Vec<u16> = (0..5)
            .map(|_| frames_rx.recv_timeout(Duration::from_secs(2)).unwrap()[[0, 0]])
            .collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 4]);

        stop.set();
        let stats = handle.join().unwrap();
        assert!(stats.frames >= 5);
        assert!(stats.dropped <= 1);
        drop(frames_rx);
    }
}
