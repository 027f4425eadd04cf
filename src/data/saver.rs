//! Streaming volume saver.
//!
//! While the `is_saving` flag is set, volumes from the saver queue are copied into an
//! in-memory chunk sized to a RAM budget. Full chunks are flushed to
//! `<output_dir>/original/NNNN.stack`; at the end of a session the partial chunk is
//! flushed and `stack_metadata.json` written. The metadata file only appears once every
//! chunk of the session has landed.
//!
//! A failed write ends the session: the error is logged, published on the error queue
//! and no metadata is written. Chunks flushed before the failure stay readable.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use ndarray::{Array4, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::config::DslmConfig;
use crate::data::chunk::write_chunk;
use crate::error::{AppResult, DslmError};
use crate::events::{ConcurrenceLog, LoggedFlag};
use crate::hardware::Volume;
use crate::queue::{recv_timeout, try_recv_latest, LatestQueue};

/// Subdirectory of the output directory holding the raw dataset.
pub const ORIGINAL_DIR: &str = "original";

/// Metadata file name.
pub const METADATA_FILE: &str = "stack_metadata.json";

/// Volume target when no experiment duration has been received.
pub const DEFAULT_N_VOLUMES: usize = 10;

const BYTES_PER_MEGABYTE: f64 = 1_048_576.0;

/// Operator-set saving configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingParameters {
    /// Dataset directory; chunks go to its `original/` subdirectory
    pub output_dir: PathBuf,
    /// Planes per volume
    pub n_planes: usize,
    /// Volumes per chunk, derived from the RAM budget at the first volume
    pub chunk_size: usize,
    /// RAM budget of one chunk, megabytes
    pub optimal_chunk_mb_ram: f64,
    /// Volumes per second, turns a duration into a volume count
    pub volume_rate: f64,
    /// Voxel size (z, y, x), micrometers
    pub voxel_size: [f64; 3],
}

impl SavingParameters {
    /// Parameters using the configured data path, RAM budget and voxel size.
    pub fn from_config(config: &DslmConfig) -> Self {
        Self {
            output_dir: config.paths.data.clone(),
            n_planes: 1,
            chunk_size: 1,
            optimal_chunk_mb_ram: config.saving.array_ram_mb,
            volume_rate: 1.0,
            voxel_size: config.saving.voxel_size,
        }
    }

    /// Directory chunk files land in.
    pub fn original_dir(&self) -> PathBuf {
        self.output_dir.join(ORIGINAL_DIR)
    }
}

/// Progress of the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingStatus {
    /// Parameters of the session
    pub target_params: SavingParameters,
    /// Volumes in the in-memory chunk
    pub i_in_chunk: usize,
    /// Volumes saved
    pub i_volume: usize,
    /// Chunks flushed
    pub i_chunk: usize,
    /// Volumes to save
    pub n_volumes: usize,
}

/// `stack_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    /// `[n_volumes, n_planes, height, width]` of the whole dataset
    pub shape_full: [usize; 4],
    /// Shape of one full chunk
    pub shape_block: [usize; 4],
    /// Crop placeholder
    pub crop_start: [usize; 4],
    /// Crop placeholder
    pub crop_end: [usize; 4],
    /// Padding placeholder
    pub padding: [usize; 4],
    /// Voxel size (z, y, x)
    pub voxel_size: [f64; 3],
}

impl StackMetadata {
    /// Read the metadata of a dataset directory (`.../original`).
    pub fn read(original_dir: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(original_dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Volumes of shape `[n_planes, height, width]` fitting in `ram_mb`, at least 1.
pub fn chunk_size_for(ram_mb: f64, volume_shape: (usize, usize, usize)) -> usize {
    let (p, h, w) = volume_shape;
    let volume_mb = 2.0 * (p * h * w) as f64 / BYTES_PER_MEGABYTE;
    if volume_mb <= 0.0 {
        return 1;
    }
    ((ram_mb / volume_mb).floor() as usize).max(1)
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Target volume count reached
    Completed,
    /// `is_saving` cleared by the operator
    Aborted,
    /// Shutdown
    Stopped,
    /// A write failed
    Failed,
}

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// How it ended
    pub end: SessionEnd,
    /// Volumes saved
    pub n_volumes: usize,
    /// Chunk files written
    pub n_chunks: usize,
    /// Whether `stack_metadata.json` was written
    pub metadata_written: bool,
}

/// Queues of the saver.
#[derive(Debug, Clone)]
pub struct SaverQueues {
    /// Volumes from the dispatcher
    pub volumes: Receiver<Volume>,
    /// Saving parameter updates
    pub parameters: Receiver<SavingParameters>,
    /// Experiment duration updates
    pub duration: Receiver<Duration>,
    /// Progress
    pub status: LatestQueue<SavingStatus>,
    /// Storage failures for the operator
    pub errors: LatestQueue<String>,
}

/// Flags of the saver.
#[derive(Debug)]
pub struct SaverSignals {
    /// Shared shutdown
    pub stop: LoggedFlag,
    /// Set by the operator to save; cleared here when a session ends
    pub is_saving: LoggedFlag,
    /// Set here when a session ends
    pub saver_stopped: LoggedFlag,
}

/// Save-session state. Owns the in-memory chunk.
#[derive(Debug)]
pub struct StreamingSaver {
    queues: SaverQueues,
    signals: SaverSignals,
    log: Arc<ConcurrenceLog>,
    poll_timeout: Duration,
    parameters: SavingParameters,
    n_volumes: usize,
    i_in_chunk: usize,
    i_chunk: usize,
    i_volume: usize,
    current: Option<Array4<u16>>,
}

impl StreamingSaver {
    /// Idle saver with `parameters`.
    pub fn new(
        queues: SaverQueues,
        signals: SaverSignals,
        log: Arc<ConcurrenceLog>,
        parameters: SavingParameters,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            queues,
            signals,
            log,
            poll_timeout,
            parameters,
            n_volumes: DEFAULT_N_VOLUMES,
            i_in_chunk: 0,
            i_chunk: 0,
            i_volume: 0,
            current: None,
        }
    }

    /// Current parameters.
    pub fn parameters(&self) -> &SavingParameters {
        &self.parameters
    }

    /// Volume target of the next or current session.
    pub fn n_volumes(&self) -> usize {
        self.n_volumes
    }

    /// Apply the newest parameters and duration.
    pub fn receive_parameters(&mut self) {
        if let Some(parameters) = try_recv_latest(&self.queues.parameters) {
            self.log.log_queue("saving_parameters", false);
            self.parameters = parameters;
        }
        if let Some(duration) = try_recv_latest(&self.queues.duration) {
            self.log.log_queue("duration", false);
            self.n_volumes = (self.parameters.volume_rate * duration.as_secs_f64()).ceil() as usize;
            tracing::debug!(
                n_volumes = self.n_volumes,
                volume_rate = self.parameters.volume_rate,
                "saving target updated"
            );
        }
    }

    fn status(&self) -> SavingStatus {
        SavingStatus {
            target_params: self.parameters.clone(),
            i_in_chunk: self.i_in_chunk,
            i_volume: self.i_volume,
            i_chunk: self.i_chunk,
            n_volumes: self.n_volumes,
        }
    }

    fn publish_status(&self) {
        self.queues.status.publish(self.status());
    }

    fn reset_counters(&mut self) {
        self.i_in_chunk = 0;
        self.i_chunk = 0;
        self.i_volume = 0;
        self.current = None;
    }

    fn begin(&mut self) -> AppResult<()> {
        let original = self.parameters.original_dir();
        let to_storage = |e: std::io::Error| DslmError::Storage(format!("{}: {e}", original.display()));
        fs::create_dir_all(&self.parameters.output_dir).map_err(to_storage)?;
        if original.join(METADATA_FILE).is_file() {
            tracing::info!(path = %original.display(), "removing previous dataset");
            fs::remove_dir_all(&original).map_err(to_storage)?;
        }
        fs::create_dir_all(&original).map_err(to_storage)?;
        self.reset_counters();
        Ok(())
    }

    fn fill(&mut self, volume: Volume) -> AppResult<()> {
        let (p, h, w) = volume.dim();
        if self.current.is_none() {
            self.parameters.chunk_size =
                chunk_size_for(self.parameters.optimal_chunk_mb_ram, (p, h, w));
            self.current = Some(Array4::zeros((self.parameters.chunk_size, p, h, w)));
            tracing::debug!(chunk_size = self.parameters.chunk_size, "chunk buffer allocated");
        }
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if current.shape()[1..] != [p, h, w] {
            return Err(DslmError::InvalidParameters(format!(
                "volume shape {:?} differs from session shape {:?}",
                (p, h, w),
                &current.shape()[1..]
            )));
        }
        current.index_axis_mut(Axis(0), self.i_in_chunk).assign(&volume);
        self.i_volume += 1;
        self.i_in_chunk += 1;
        self.publish_status();

        if self.i_in_chunk == self.parameters.chunk_size {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> AppResult<()> {
        let Some(current) = self.current.as_ref() else {
            return Ok(());
        };
        let filled = current.slice_axis(Axis(0), Slice::from(..self.i_in_chunk));
        write_chunk(&self.parameters.original_dir(), self.i_chunk, filled)?;
        self.log.log_message(&format!("saved chunk {}", self.i_chunk));
        self.i_in_chunk = 0;
        self.i_chunk += 1;
        self.publish_status();
        Ok(())
    }

    fn write_metadata(&self) -> AppResult<()> {
        let Some(current) = self.current.as_ref() else {
            return Ok(());
        };
        let &[chunk, p, h, w] = current.shape() else {
            return Ok(());
        };
        let metadata = StackMetadata {
            shape_full: [self.i_volume, p, h, w],
            shape_block: [chunk, p, h, w],
            crop_start: [0; 4],
            crop_end: [0; 4],
            padding: [0; 4],
            voxel_size: self.parameters.voxel_size,
        };
        let path = self.parameters.original_dir().join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&metadata)?;
        fs::write(&path, json)
            .map_err(|e| DslmError::Storage(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }

    fn save_volumes(&mut self) -> AppResult<SessionEnd> {
        loop {
            if self.i_volume >= self.n_volumes {
                return Ok(SessionEnd::Completed);
            }
            if self.signals.stop.is_set() {
                return Ok(SessionEnd::Stopped);
            }
            if !self.signals.is_saving.is_set() {
                return Ok(SessionEnd::Aborted);
            }
            self.receive_parameters();
            if let Some(volume) = recv_timeout(&self.queues.volumes, self.poll_timeout) {
                self.log.log_queue("saver", false);
                self.fill(volume)?;
            }
        }
    }

    fn finish(&mut self) -> AppResult<bool> {
        if self.i_volume == 0 {
            return Ok(false);
        }
        if self.i_in_chunk > 0 {
            self.flush_chunk()?;
        }
        self.publish_status();
        self.write_metadata()?;
        self.log.log_message("finished saving");
        Ok(true)
    }

    /// Run one session from the current state of the flags.
    ///
    /// Always ends with `is_saving` cleared, `saver_stopped` set and counters reset.
    pub fn run_session(&mut self) -> SessionSummary {
        // settings sent before the flag are queued ahead of it
        self.receive_parameters();
        tracing::info!(
            output_dir = %self.parameters.output_dir.display(),
            n_volumes = self.n_volumes,
            "saving session started"
        );
        let outcome = self
            .begin()
            .and_then(|()| self.save_volumes())
            .and_then(|end| self.finish().map(|written| (end, written)));

        let (end, metadata_written) = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, chunks = self.i_chunk, "saving session failed");
                self.log.log_message(&format!("saving failed: {e}"));
                self.queues.errors.publish(e.to_string());
                (SessionEnd::Failed, false)
            }
        };
        let summary = SessionSummary {
            end,
            n_volumes: self.i_volume,
            n_chunks: self.i_chunk,
            metadata_written,
        };

        self.signals.is_saving.clear();
        self.signals.saver_stopped.set();
        self.reset_counters();
        self.publish_status();
        tracing::info!(?summary, "saving session ended");
        summary
    }
}

/// Everything the saver thread owns.
#[derive(Debug)]
pub struct SaverContext {
    /// Session state and queues
    pub saver: StreamingSaver,
}

/// Run the saver until the stop flag is set. Returns every session's summary.
pub fn run_saver(ctx: SaverContext) -> Vec<SessionSummary> {
    let SaverContext { mut saver } = ctx;
    saver.log.log_message("started");
    tracing::info!("saver started");
    let mut sessions = Vec::new();

    while !saver.signals.stop.is_set() {
        if saver.signals.is_saving.is_set() {
            sessions.push(saver.run_session());
        } else {
            saver.receive_parameters();
            thread::sleep(saver.poll_timeout);
        }
    }

    saver.log.log_message("stopped");
    saver.log.flush();
    tracing::info!(sessions = sessions.len(), "saver stopped");
    sessions
}

/// Spawn [`run_saver`] on a named thread.
pub fn spawn_saver(ctx: SaverContext) -> AppResult<JoinHandle<Vec<SessionSummary>>> {
    thread::Builder::new()
        .name("saver".to_string())
        .spawn(move || run_saver(ctx))
        .map_err(|e| DslmError::Worker(format!("failed to spawn saver: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::chunk::{chunk_path, read_chunk};
    use crate::events::DslmEvent;
    use crossbeam_channel::{unbounded, Sender};
    use ndarray::Array3;

    struct Rig {
        saver: StreamingSaver,
        volumes: Sender<Volume>,
        parameters: Sender<SavingParameters>,
        duration: Sender<Duration>,
        status: LatestQueue<SavingStatus>,
        errors: LatestQueue<String>,
        is_saving: LoggedFlag,
        saver_stopped: LoggedFlag,
    }

    fn rig(output_dir: &Path, volume_shape: (usize, usize, usize), volumes_per_chunk: f64) -> Rig {
        let log = ConcurrenceLog::disabled("saver");
        let (volumes_tx, volumes_rx) = unbounded();
        let (params_tx, params_rx) = unbounded();
        let (duration_tx, duration_rx) = unbounded();
        let status = LatestQueue::new(64);
        let errors = LatestQueue::new(4);
        let is_saving = LoggedFlag::new(DslmEvent::IsSaving, log.clone());
        let saver_stopped = LoggedFlag::new(DslmEvent::SavingStopped, log.clone());
        let (p, h, w) = volume_shape;
        let parameters = SavingParameters {
            output_dir: output_dir.to_path_buf(),
            n_planes: p,
            chunk_size: 1,
            optimal_chunk_mb_ram: volumes_per_chunk * 2.0 * (p * h * w) as f64 / BYTES_PER_MEGABYTE,
            volume_rate: 2.0,
            voxel_size: [2.0, 0.6, 0.6],
        };
        let saver = StreamingSaver::new(
            SaverQueues {
                volumes: volumes_rx,
                parameters: params_rx,
                duration: duration_rx,
                status: status.clone(),
                errors: errors.clone(),
            },
            SaverSignals {
                stop: LoggedFlag::new(DslmEvent::CloseAll, log.clone()),
                is_saving: is_saving.new_reference(log.clone()),
                saver_stopped: saver_stopped.new_reference(log.clone()),
            },
            log,
            parameters,
            Duration::from_millis(1),
        );
        Rig {
            saver,
            volumes: volumes_tx,
            parameters: params_tx,
            duration: duration_tx,
            status,
            errors,
            is_saving,
            saver_stopped,
        }
    }

    fn volume(shape: (usize, usize, usize), value: u16) -> Volume {
        Array3::from_elem(shape, value)
    }

    #[test]
    fn test_chunk_size_for_budget() {
        assert_eq!(chunk_size_for(450.0, (1, 1024, 1024)), 225);
        assert_eq!(chunk_size_for(450.0, (300, 1024, 1024)), 1);
        assert_eq!(chunk_size_for(1.0, (0, 0, 0)), 1);
    }

    #[test]
    fn test_duration_sets_volume_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(dir.path(), (2, 4, 4), 2.0);
        assert_eq!(rig.saver.n_volumes(), DEFAULT_N_VOLUMES);
        rig.duration.send(Duration::from_millis(2_600)).unwrap();
        rig.saver.receive_parameters();
        // 2 volumes/s for 2.6 s
        assert_eq!(rig.saver.n_volumes(), 6);
    }

    #[test]
    fn test_five_volumes_in_chunks_of_two() {
        let dir = tempfile::tempdir().unwrap();
        let shape = (2, 16, 16);
        let mut rig = rig(dir.path(), shape, 2.0);
        rig.duration.send(Duration::from_millis(2_500)).unwrap();
        for i in 0..5 {
            rig.volumes.send(volume(shape, i)).unwrap();
        }
        rig.is_saving.set();

        let summary = rig.saver.run_session();
        assert_eq!(summary.end, SessionEnd::Completed);
        assert_eq!(summary.n_volumes, 5);
        assert_eq!(summary.n_chunks, 3);
        assert!(summary.metadata_written);

        let original = dir.path().join(ORIGINAL_DIR);
        let counts: Vec<usize> = (0..3)
            .map(|i| read_chunk(&chunk_path(&original, i)).unwrap().shape()[0])
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
        let last = read_chunk(&chunk_path(&original, 2)).unwrap();
        assert!(last.iter().all(|&v| v == 4));

        let metadata = StackMetadata::read(&original).unwrap();
        assert_eq!(metadata.shape_full, [5, 2, 16, 16]);
        assert_eq!(metadata.shape_block, [2, 2, 16, 16]);
        assert_eq!(metadata.padding, [0; 4]);
        assert_eq!(metadata.voxel_size, [2.0, 0.6, 0.6]);

        assert!(!rig.is_saving.is_set());
        assert!(rig.saver_stopped.is_set());
        let reset = rig.status.latest().unwrap();
        assert_eq!((reset.i_volume, reset.i_chunk, reset.i_in_chunk), (0, 0, 0));
    }

    #[test]
    fn test_session_uses_settings_sent_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let shape = (1, 4, 4);
        let mut rig = rig(&dir.path().join("old"), shape, 1.0);
        let mut parameters = rig.saver.parameters().clone();
        parameters.output_dir = dir.path().join("new");
        rig.parameters.send(parameters).unwrap();
        // 2 volumes/s for 1 s
        rig.duration.send(Duration::from_secs(1)).unwrap();
        for i in 0..2 {
            rig.volumes.send(volume(shape, i)).unwrap();
        }
        rig.is_saving.set();

        let summary = rig.saver.run_session();
        assert_eq!(summary.end, SessionEnd::Completed);
        assert_eq!(summary.n_volumes, 2);
        assert!(dir.path().join("new").join(ORIGINAL_DIR).join(METADATA_FILE).is_file());
        assert!(!dir.path().join("old").exists());
    }

    #[test]
    fn test_second_session_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(dir.path(), (2, 8, 8), 2.0);
        rig.duration.send(Duration::from_millis(1_500)).unwrap();
        for i in 0..3 {
            rig.volumes.send(volume((2, 8, 8), i)).unwrap();
        }
        rig.is_saving.set();
        assert_eq!(rig.saver.run_session().n_chunks, 2);

        // different plane count, same directory
        for i in 0..3 {
            rig.volumes.send(volume((3, 8, 8), 10 + i)).unwrap();
        }
        rig.is_saving.set();
        let summary = rig.saver.run_session();
        assert_eq!(summary.n_volumes, 3);

        let original = dir.path().join(ORIGINAL_DIR);
        let first = read_chunk(&chunk_path(&original, 0)).unwrap();
        assert_eq!(first.shape()[1], 3);
        assert!(first.iter().all(|&v| v >= 10));
        assert_eq!(StackMetadata::read(&original).unwrap().shape_full[0], 3);
    }

    #[test]
    fn test_abort_flushes_partial_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let shape = (1, 4, 4);
        let mut rig = rig(dir.path(), shape, 4.0);
        for i in 0..3 {
            rig.volumes.send(volume(shape, i)).unwrap();
        }
        rig.is_saving.set();
        let flag = rig.is_saving.new_reference(ConcurrenceLog::disabled("test"));
        let volumes = rig.volumes.clone();
        let aborter = thread::spawn(move || {
            while !volumes.is_empty() {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(20));
            flag.clear();
        });
        let summary = rig.saver.run_session();
        aborter.join().unwrap();

        assert_eq!(summary.end, SessionEnd::Aborted);
        assert_eq!(summary.n_volumes, 3);
        assert_eq!(summary.n_chunks, 1);
        let original = dir.path().join(ORIGINAL_DIR);
        assert_eq!(read_chunk(&chunk_path(&original, 0)).unwrap().shape()[0], 3);
        assert!(original.join(METADATA_FILE).is_file());
    }

    #[test]
    fn test_unwritable_output_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        // output_dir is a regular file: nothing can be created below it
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"x").unwrap();
        let mut rig = rig(&blocked, (1, 4, 4), 1.0);
        rig.volumes.send(volume((1, 4, 4), 1)).unwrap();
        rig.is_saving.set();

        let summary = rig.saver.run_session();
        assert_eq!(summary.end, SessionEnd::Failed);
        assert!(!summary.metadata_written);
        assert!(!rig.is_saving.is_set());
        assert!(rig.saver_stopped.is_set());
        assert!(rig.errors.latest().is_some_and(|e| e.contains("Storage")));
    }
}
