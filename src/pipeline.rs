//! Worker wiring and operator operations.
//!
//! [`Microscope::start`] creates every queue and flag, spawns the scanner, camera,
//! dispatcher and saver threads, and keeps the operator ends. Queue layout:
//!
//! ```text
//! scan params ──> scanner ──(board)──> trigger line ──> camera
//!                    │                                     │ frames
//!                    └── waveform                          v
//!                                n_planes, reference ─> dispatcher ──> viewer
//!                                                          │ volumes (is_saving)
//!                            saving params, duration ──> saver ──> status, errors
//! ```
//!
//! Shutdown raises the shared stop flag and joins each worker with a timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ndarray::{Array2, Axis};

use crate::acquisition::camera::{spawn_camera, CameraContext, CameraMode, CameraParameters, CameraStats};
use crate::acquisition::dispatcher::{
    spawn_dispatcher, DispatcherContext, DispatcherOutputs, DispatcherSignals, DispatcherStats,
    VolumeDispatcher,
};
use crate::config::DslmConfig;
use crate::data::saver::{
    spawn_saver, SaverContext, SaverQueues, SaverSignals, SavingParameters, SavingStatus,
    SessionSummary, StreamingSaver,
};
use crate::error::{AppResult, DslmError};
use crate::events::{ConcurrenceLog, DslmEvent, LoggedFlag};
use crate::hardware::capabilities::{BoardOpener, FrameSource, Roi, TriggerMode};
use crate::hardware::{Frame, Volume};
use crate::queue::{drain, recv_timeout, try_recv_latest, LatestQueue};
use crate::scanning::manager::{effective_n_planes, merits_restart, significant_change, volume_rate};
use crate::scanning::parameters::{ScanParameters, ScanningMode};
use crate::scanning::scan_loop::ScanSignals;
use crate::scanning::scanner::{spawn_scanner, ScannerContext, ScannerStats};

fn open_log(config: &DslmConfig, worker: &str) -> AppResult<Arc<ConcurrenceLog>> {
    if config.application.concurrence_log {
        ConcurrenceLog::to_dir(worker, &config.paths.log)
    } else {
        Ok(ConcurrenceLog::disabled(worker))
    }
}

/// What each worker reported on exit.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Scanner counters
    pub scanner: Option<ScannerStats>,
    /// Camera counters
    pub camera: Option<CameraStats>,
    /// Dispatcher counters
    pub dispatcher: Option<DispatcherStats>,
    /// Saving sessions
    pub sessions: Vec<SessionSummary>,
}

#[derive(Default)]
struct Workers {
    scanner: Option<JoinHandle<ScannerStats>>,
    camera: Option<JoinHandle<CameraStats>>,
    dispatcher: Option<JoinHandle<DispatcherStats>>,
    saver: Option<JoinHandle<Vec<SessionSummary>>>,
}

/// Join `handle`, giving up after `deadline`.
fn join_until<T>(
    name: &str,
    handle: Option<JoinHandle<T>>,
    deadline: Instant,
    failed: &mut Vec<String>,
) -> Option<T> {
    let handle = handle?;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::error!(worker = name, "worker did not exit in time");
            failed.push(name.to_string());
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(worker = name, "worker panicked");
            failed.push(format!("{name} (panicked)"));
            None
        }
    }
}

/// Running microscope: worker threads plus the operator's ends of every queue.
pub struct Microscope {
    log: Arc<ConcurrenceLog>,
    join_timeout: Duration,
    poll_timeout: Duration,
    sample_rate: f64,

    stop: LoggedFlag,
    restart: LoggedFlag,
    wait: LoggedFlag,
    experiment_start: LoggedFlag,
    is_saving: LoggedFlag,
    saver_stopped: LoggedFlag,
    noise_subtraction: LoggedFlag,

    scan_tx: Sender<ScanParameters>,
    camera_tx: Sender<CameraParameters>,
    saving_tx: Sender<SavingParameters>,
    duration_tx: Sender<Duration>,
    n_planes_tx: Sender<usize>,
    reference_tx: Sender<Frame>,

    camera_drain: Receiver<Frame>,
    saver_drain: Receiver<Volume>,
    viewer: Receiver<Volume>,
    waveform: LatestQueue<Vec<f64>>,
    frame_rate: LatestQueue<f64>,
    status: LatestQueue<SavingStatus>,
    errors: LatestQueue<String>,

    scan: ScanParameters,
    camera: CameraParameters,
    saving: SavingParameters,
    workers: Workers,
}

impl std::fmt::Debug for Microscope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microscope")
            .field("scan", &self.scan)
            .field("camera", &self.camera)
            .field("saving", &self.saving)
            .finish_non_exhaustive()
    }
}

impl Microscope {
    /// Spawn every worker. The microscope starts paused.
    pub fn start(
        config: &DslmConfig,
        opener: Box<dyn BoardOpener>,
        camera: Box<dyn FrameSource>,
    ) -> AppResult<Self> {
        config.validate()?;
        let log = open_log(config, "main")?;
        let queues = &config.queues;

        let stop = LoggedFlag::new(DslmEvent::CloseAll, log.clone());
        let restart = LoggedFlag::new(DslmEvent::RestartScanning, log.clone());
        let wait = LoggedFlag::new(DslmEvent::WaitingForTrigger, log.clone());
        let experiment_start = LoggedFlag::new(DslmEvent::ExperimentStart, log.clone());
        let is_saving = LoggedFlag::new(DslmEvent::IsSaving, log.clone());
        let saver_stopped = LoggedFlag::new(DslmEvent::SavingStopped, log.clone());
        let noise_subtraction = LoggedFlag::new(DslmEvent::NoiseSubtractionActive, log.clone());

        let (scan_tx, scan_rx) = unbounded();
        let (camera_tx, camera_params_rx) = unbounded();
        let (saving_tx, saving_rx) = unbounded();
        let (duration_tx, duration_rx) = unbounded();
        let (n_planes_tx, n_planes_rx) = unbounded();
        let (reference_tx, reference_rx) = unbounded();
        let (frames_tx, frames_rx) = bounded(queues.camera_capacity);
        let (viewer_tx, viewer_rx) = bounded(queues.viewer_capacity);
        let (saver_tx, saver_rx) = bounded(queues.saver_capacity);
        let waveform = LatestQueue::new(1);
        let frame_rate = LatestQueue::new(1);
        let status = LatestQueue::new(16);
        let errors = LatestQueue::new(16);

        let camera_parameters = CameraParameters::from_config(&config.camera);
        let saving = SavingParameters::from_config(config);
        let mut workers = Workers::default();

        let scanner_log = open_log(config, "scanner")?;
        workers.scanner = Some(spawn_scanner(ScannerContext {
            opener,
            parameters: scan_rx,
            waveform: waveform.clone(),
            signals: ScanSignals {
                stop: stop.new_reference(scanner_log.clone()),
                restart: restart.new_reference(scanner_log.clone()),
                wait: wait.new_reference(scanner_log.clone()),
                experiment_start: experiment_start.new_reference(scanner_log.clone()),
            },
            log: scanner_log,
            sample_rate: config.scanning.sample_rate,
            n_samples: config.scanning.n_samples,
            poll_timeout: queues.poll_timeout,
        })?);

        let camera_log = open_log(config, "camera")?;
        workers.camera = Some(spawn_camera(CameraContext {
            camera,
            parameters: camera_params_rx,
            frames: frames_tx,
            frame_rate: frame_rate.clone(),
            stop: stop.new_reference(camera_log.clone()),
            log: camera_log,
            initial: camera_parameters,
            n_fps_frames: config.camera.n_fps_frames,
            poll_timeout: queues.poll_timeout,
        })?);

        let dispatcher_log = open_log(config, "dispatcher")?;
        let dispatcher = VolumeDispatcher::new(
            DispatcherOutputs {
                viewer: viewer_tx,
                saver: saver_tx,
                saver_drain: saver_rx.clone(),
            },
            DispatcherSignals {
                stop: stop.new_reference(dispatcher_log.clone()),
                wait: wait.new_reference(dispatcher_log.clone()),
                is_saving: is_saving.new_reference(dispatcher_log.clone()),
                noise_subtraction: noise_subtraction.new_reference(dispatcher_log.clone()),
            },
            dispatcher_log,
            queues.poll_timeout,
        );
        workers.dispatcher = Some(spawn_dispatcher(DispatcherContext {
            dispatcher,
            camera: frames_rx.clone(),
            n_planes: n_planes_rx,
            reference: reference_rx,
        })?);

        let saver_log = open_log(config, "saver")?;
        let saver = StreamingSaver::new(
            SaverQueues {
                volumes: saver_rx.clone(),
                parameters: saving_rx,
                duration: duration_rx,
                status: status.clone(),
                errors: errors.clone(),
            },
            SaverSignals {
                stop: stop.new_reference(saver_log.clone()),
                is_saving: is_saving.new_reference(saver_log.clone()),
                saver_stopped: saver_stopped.new_reference(saver_log.clone()),
            },
            saver_log,
            saving.clone(),
            queues.poll_timeout,
        );
        workers.saver = Some(spawn_saver(SaverContext { saver })?);

        log.log_message("initialized");
        tracing::info!(name = %config.application.name, "microscope started");

        Ok(Self {
            log,
            join_timeout: queues.join_timeout,
            poll_timeout: queues.poll_timeout,
            sample_rate: config.scanning.sample_rate,
            stop,
            restart,
            wait,
            experiment_start,
            is_saving,
            saver_stopped,
            noise_subtraction,
            scan_tx,
            camera_tx,
            saving_tx,
            duration_tx,
            n_planes_tx,
            reference_tx,
            camera_drain: frames_rx,
            saver_drain: saver_rx,
            viewer: viewer_rx,
            waveform,
            frame_rate,
            status,
            errors,
            scan: ScanParameters::default(),
            camera: camera_parameters,
            saving,
            workers,
        })
    }

    fn send<T>(&self, tx: &Sender<T>, queue: &str, value: T) -> AppResult<()> {
        tx.send(value)
            .map_err(|_| DslmError::Worker(format!("{queue} receiver")))?;
        self.log.log_queue(queue, true);
        Ok(())
    }

    /// Current scan parameters.
    pub fn scan_parameters(&self) -> &ScanParameters {
        &self.scan
    }

    /// Analog sample rate, Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Send new scan parameters.
    ///
    /// Volumetric changes also restart the scan loop. A mode or plane count change
    /// resizes volumes in the dispatcher and saver, and a mode change reconfigures the
    /// camera trigger.
    pub fn set_scan_parameters(&mut self, parameters: ScanParameters) -> AppResult<()> {
        let old = std::mem::replace(&mut self.scan, parameters);
        self.send(&self.scan_tx, "scan_parameters", parameters)?;

        if merits_restart(&parameters) && old.mode == parameters.mode && old != parameters {
            self.restart.set();
        }
        if parameters.mode != old.mode {
            self.send_camera_parameters()?;
        }
        if significant_change(&parameters, &old) {
            self.send(&self.n_planes_tx, "n_planes", effective_n_planes(&parameters))?;
        }
        self.send_saving_parameters()
    }

    /// Change exposure, binning and region of interest.
    pub fn set_camera_parameters(
        &mut self,
        exposure_ms: f64,
        binning: usize,
        roi: Option<Roi>,
    ) -> AppResult<()> {
        self.camera.exposure_ms = exposure_ms;
        self.camera.binning = binning;
        self.camera.roi = roi;
        self.send_camera_parameters()
    }

    fn send_camera_parameters(&mut self) -> AppResult<()> {
        self.camera.trigger_mode = match self.scan.mode {
            ScanningMode::Volumetric | ScanningMode::TriggeredPlanar => TriggerMode::ExternalTrigger,
            ScanningMode::Paused | ScanningMode::Planar => TriggerMode::Free,
        };
        self.camera.mode = match self.scan.mode {
            ScanningMode::Paused => CameraMode::Paused,
            _ => CameraMode::Preview,
        };
        drain(&self.camera_drain);
        self.send(&self.camera_tx, "camera_parameters", self.camera)
    }

    /// Replace the saving parameters. Plane count and volume rate follow the scan.
    pub fn set_saving_parameters(&mut self, parameters: SavingParameters) -> AppResult<()> {
        self.saving = parameters;
        self.send_saving_parameters()
    }

    /// Save datasets below `output_dir`.
    pub fn set_output_dir(&mut self, output_dir: PathBuf) -> AppResult<()> {
        self.saving.output_dir = output_dir;
        self.send_saving_parameters()
    }

    fn send_saving_parameters(&mut self) -> AppResult<()> {
        self.saving.n_planes = effective_n_planes(&self.scan);
        let rate = volume_rate(&self.scan);
        if rate > 0.0 {
            self.saving.volume_rate = rate;
        }
        self.send(&self.saving_tx, "saving_parameters", self.saving.clone())
    }

    /// Duration of the next experiment; the saver turns it into a volume count.
    pub fn set_experiment_duration(&self, duration: Duration) -> AppResult<()> {
        self.send(&self.duration_tx, "duration", duration)
    }

    /// Start saving, aligned to the first volume after a scan restart.
    pub fn start_experiment(&mut self) -> AppResult<()> {
        self.log.log_message("started experiment");
        tracing::info!(output_dir = %self.saving.output_dir.display(), "experiment started");
        self.wait.set();
        self.send_saving_parameters()?;
        self.restart.set();
        if self.scan.mode != ScanningMode::Paused && self.scan.validate().is_ok() {
            // frames of the running loop must not reach the first saved volume
            let deadline = Instant::now() + self.join_timeout;
            while self.restart.is_set() && Instant::now() < deadline {
                thread::sleep(self.poll_timeout);
            }
        }
        drain(&self.saver_drain);
        drain(&self.camera_drain);
        self.saver_stopped.clear();
        self.is_saving.set();
        Ok(())
    }

    /// Stop saving; the saver flushes and finalizes the dataset.
    pub fn end_experiment(&mut self) -> AppResult<()> {
        self.log.log_message("experiment ended");
        tracing::info!("experiment ended");
        self.is_saving.clear();
        self.experiment_start.clear();
        drain(&self.saver_drain);
        self.send_saving_parameters()
    }

    /// Block until the saver reports the end of its session, at most `timeout`.
    pub fn wait_for_saving_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.saver_stopped.is_set() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.poll_timeout);
        }
        true
    }

    /// Whether a save session is running.
    pub fn is_saving(&self) -> bool {
        self.is_saving.is_set()
    }

    /// Whether the camera trigger has started since the last experiment start.
    pub fn experiment_started(&self) -> bool {
        self.experiment_start.is_set()
    }

    /// Whether frames are currently being discarded.
    pub fn is_waiting(&self) -> bool {
        self.wait.is_set()
    }

    /// Subtract `reference` from every frame.
    pub fn set_noise_reference(&self, reference: Frame) -> AppResult<()> {
        self.send(&self.reference_tx, "noise_reference", reference)?;
        self.noise_subtraction.set();
        Ok(())
    }

    /// Stop subtracting the noise reference.
    pub fn reset_noise_subtraction(&self) {
        self.noise_subtraction.clear();
    }

    /// Average the first plane of the next `n_images` volumes into a noise reference
    /// and activate subtraction. `None` if the volumes did not arrive within `timeout`.
    pub fn average_noise_reference(&self, n_images: usize, timeout: Duration) -> Option<Frame> {
        self.noise_subtraction.clear();
        let deadline = Instant::now() + timeout;
        let mut sum: Option<Array2<f64>> = None;
        let mut n = 0usize;
        while n < n_images.max(1) {
            if Instant::now() >= deadline {
                tracing::warn!(received = n, wanted = n_images, "noise averaging timed out");
                return None;
            }
            let Some(volume) = self.next_volume() else {
                continue;
            };
            let plane = volume.index_axis(Axis(0), 0).mapv(f64::from);
            let same_shape = sum.as_ref().is_some_and(|acc| acc.dim() == plane.dim());
            if same_shape {
                if let Some(acc) = sum.as_mut() {
                    *acc += &plane;
                }
            } else {
                sum = Some(plane);
                n = 0;
            }
            n += 1;
        }
        let reference = sum?.mapv(|v| (v / n as f64).round() as u16);
        self.set_noise_reference(reference.clone()).ok()?;
        Some(reference)
    }

    /// Next volume for display, waiting at most the poll timeout.
    pub fn next_volume(&self) -> Option<Volume> {
        recv_timeout(&self.viewer, self.poll_timeout)
    }

    /// Newest volume for display, discarding older ones.
    pub fn latest_volume(&self) -> Option<Volume> {
        try_recv_latest(&self.viewer)
    }

    /// Newest saving progress.
    pub fn latest_saving_status(&self) -> Option<SavingStatus> {
        self.status.latest()
    }

    /// Newest camera frame rate, frames per second.
    pub fn latest_frame_rate(&self) -> Option<f64> {
        self.frame_rate.latest()
    }

    /// Newest recorded piezo waveform (one volume period).
    pub fn latest_waveform(&self) -> Option<Vec<f64>> {
        self.waveform.latest()
    }

    /// Storage failures since the last call.
    pub fn storage_errors(&self) -> Vec<String> {
        std::iter::from_fn(|| self.errors.next()).collect()
    }

    /// Stop every worker and wait for them.
    pub fn shutdown(mut self) -> AppResult<ShutdownReport> {
        tracing::info!("shutting down");
        self.log.log_message("closing");
        self.stop.set();

        let workers = std::mem::take(&mut self.workers);
        let mut failed = Vec::new();
        let timeout = self.join_timeout;
        let report = ShutdownReport {
            scanner: join_until("scanner", workers.scanner, Instant::now() + timeout, &mut failed),
            camera: join_until("camera", workers.camera, Instant::now() + timeout, &mut failed),
            dispatcher: join_until(
                "dispatcher",
                workers.dispatcher,
                Instant::now() + timeout,
                &mut failed,
            ),
            sessions: join_until("saver", workers.saver, Instant::now() + timeout, &mut failed)
                .unwrap_or_default(),
        };
        self.log.flush();

        if failed.is_empty() {
            tracing::info!(?report, "all workers stopped");
            Ok(report)
        } else {
            Err(DslmError::ShutdownFailed(failed))
        }
    }
}

impl Drop for Microscope {
    fn drop(&mut self) {
        self.stop.set();
    }
}
