//! Per-tick scan control loop.
//!
//! One [`ScanLoop`] owns one board session for as long as a scan mode stays active.
//! Every tick it:
//!
//! 1. drains the parameter queue to the newest [`ScanParameters`],
//! 2. reinitializes counters (and, in volumetric mode, resizes its buffers) if they
//!    changed,
//! 3. exits on stop, restart or a mode change,
//! 4. fills the output arrays for the mode,
//! 5. writes them, starts the board on the first tick, reads the piezo feedback,
//! 6. advances `i_sample` modulo the scan period.
//!
//! Hardware faults are returned to the caller; the loop never retries by itself.

use crossbeam_channel::Receiver;

use crate::data::rolling_buffer::{FillingRollingBuffer, RollingBuffer};
use crate::error::HardwareError;
use crate::events::{ConcurrenceLog, LoggedFlag};
use crate::hardware::capabilities::{ScanBoard, ScanChannel};
use crate::queue::{try_recv_latest, LatestQueue};
use crate::scanning::parameters::{
    samples_per_period, ScanParameters, ScanningMode, SyncCoefficients, ZParameters,
};
use crate::scanning::trigger::{CameraTrigger, GateState, GateTransition};
use crate::waveforms::{
    set_impulses, time_vector, SawtoothWaveform, TriangleWaveform, Waveform, CAMERA_PULSE_HIGH,
};

/// Galvo commands derived from the piezo recording must stay strictly inside this
/// window, volts.
pub const SAFE_GALVO_RANGE: (f64, f64) = (-2.0, 2.0);

/// Volume rates at or below this keep the previous buffer sizes, Hz.
const MIN_RESIZE_FREQUENCY: f64 = 0.1;

/// Flags the scan loop reads and drives.
#[derive(Debug)]
pub struct ScanSignals {
    /// Shared shutdown
    pub stop: LoggedFlag,
    /// Tear down and reopen the board
    pub restart: LoggedFlag,
    /// Frames arriving now are not part of a volume
    pub wait: LoggedFlag,
    /// Camera triggering began
    pub experiment_start: LoggedFlag,
}

/// Queues and logging of the scan loop.
#[derive(Debug, Clone, Copy)]
pub struct ScanLoopIo<'a> {
    /// Incoming parameters
    pub parameters: &'a Receiver<ScanParameters>,
    /// Recorded piezo waveform for display
    pub waveform: &'a LatestQueue<Vec<f64>>,
    /// Control flags
    pub signals: &'a ScanSignals,
    /// Scanner concurrence log
    pub log: &'a ConcurrenceLog,
}

/// Why [`ScanLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Stop flag set
    Stopped,
    /// Restart flag consumed
    Restart,
    /// Parameters switched to another mode
    ModeChanged(ScanningMode),
    /// Parameters cannot be run in the current mode
    InvalidParameters,
}

fn is_safe(value: f64) -> bool {
    SAFE_GALVO_RANGE.0 < value && value < SAFE_GALVO_RANGE.1
}

/// Affine-map `wave` through `sync` if both extremes land inside the safe window.
fn synced_galvo(wave: &[f64], min: f64, max: f64, sync: &SyncCoefficients) -> Option<Vec<f64>> {
    if is_safe(sync.apply(min)) && is_safe(sync.apply(max)) {
        Some(wave.iter().map(|&z| sync.apply(z)).collect())
    } else {
        None
    }
}

/// Scan loop for one active mode and one board session.
pub struct ScanLoop<'a> {
    board: Box<dyn ScanBoard>,
    io: ScanLoopIo<'a>,
    mode: ScanningMode,
    parameters: ScanParameters,
    sample_rate: f64,
    n_samples: usize,
    period: usize,
    started: bool,
    i_sample: usize,
    n_samples_read: usize,
    n_acquired: u64,
    lateral: TriangleWaveform,
    frontal: TriangleWaveform,
    z_waveform: SawtoothWaveform,
    recorded: FillingRollingBuffer,
    camera_pulses: RollingBuffer,
    gate: CameraTrigger,
}

impl std::fmt::Debug for ScanLoop<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLoop")
            .field("mode", &self.mode)
            .field("i_sample", &self.i_sample)
            .field("n_samples_read", &self.n_samples_read)
            .field("period", &self.period)
            .field("gate", &self.gate.state())
            .finish()
    }
}

impl<'a> ScanLoop<'a> {
    /// Build the loop for `parameters.mode`, which must be active.
    pub fn new(
        board: Box<dyn ScanBoard>,
        io: ScanLoopIo<'a>,
        parameters: ScanParameters,
        sample_rate: f64,
    ) -> Self {
        let n_samples = board.n_samples();
        let mut scan_loop = Self {
            board,
            io,
            mode: parameters.mode,
            parameters,
            sample_rate,
            n_samples,
            period: parameters.scan_period(sample_rate),
            started: false,
            i_sample: 0,
            n_samples_read: 0,
            n_acquired: 0,
            lateral: parameters.xy.lateral.waveform(),
            frontal: parameters.xy.frontal.waveform(),
            z_waveform: SawtoothWaveform::new(1.0, 0.0, 0.0),
            recorded: FillingRollingBuffer::new(0),
            camera_pulses: RollingBuffer::new(0),
            gate: CameraTrigger::new(),
        };
        scan_loop.resize_buffers();
        scan_loop.configure_mode();
        scan_loop.initialize();
        scan_loop
    }

    /// Parameters currently governing the loop.
    pub fn parameters(&self) -> &ScanParameters {
        &self.parameters
    }

    /// Ticks completed.
    pub fn ticks(&self) -> u64 {
        self.n_acquired
    }

    /// Current camera gate state.
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Reset counters and switch the camera off.
    pub fn initialize(&mut self) {
        self.i_sample = 0;
        self.n_samples_read = 0;
        self.n_acquired = 0;
        if self.uses_gate() {
            self.gate.reset();
            self.recorded.reset();
            self.io.signals.wait.set();
        }
    }

    /// Tick until stopped, restarted, or switched to another mode.
    pub fn run(&mut self) -> Result<LoopExit, HardwareError> {
        tracing::info!(mode = ?self.mode, period = self.period, "scan loop started");
        self.io.log.log_message(&format!("scan loop started {:?}", self.mode));
        let result = self.run_ticks();
        self.gate.stop();
        if let Ok(exit) = &result {
            tracing::info!(?exit, ticks = self.n_acquired, "scan loop exited");
        }
        result
    }

    fn run_ticks(&mut self) -> Result<LoopExit, HardwareError> {
        loop {
            self.update_settings();
            if let Some(exit) = self.exit_condition() {
                return Ok(exit);
            }
            self.tick()?;
        }
    }

    fn uses_gate(&self) -> bool {
        matches!(
            self.mode,
            ScanningMode::Volumetric | ScanningMode::TriggeredPlanar
        )
    }

    fn exit_condition(&self) -> Option<LoopExit> {
        if self.io.signals.restart.is_set() {
            self.io.signals.restart.clear();
            return Some(LoopExit::Restart);
        }
        if self.io.signals.stop.is_set() {
            return Some(LoopExit::Stopped);
        }
        if self.parameters.mode != self.mode {
            return Some(LoopExit::ModeChanged(self.parameters.mode));
        }
        if self.parameters.validate().is_err() {
            return Some(LoopExit::InvalidParameters);
        }
        None
    }

    /// Apply the newest queued parameters, then re-evaluate the camera gate.
    fn update_settings(&mut self) {
        if let Some(new) = try_recv_latest(self.io.parameters) {
            self.io.log.log_queue("scan_parameters", false);
            let changed = new != self.parameters;
            self.parameters = new;
            self.lateral = new.xy.lateral.waveform();
            self.frontal = new.xy.frontal.waveform();

            if changed && new.mode == self.mode && new.validate().is_ok() {
                tracing::debug!(mode = ?self.mode, "scan parameters changed, reinitializing");
                self.period = new.scan_period(self.sample_rate);
                self.resize_buffers();
                self.configure_mode();
                self.initialize();
            }
        }

        if self.uses_gate() {
            match self.gate.update(self.n_samples_read, self.period) {
                GateTransition::Armed { first } => {
                    tracing::debug!(first, "camera switched on");
                    self.io.log.log_message("camera on");
                    if first {
                        self.io.signals.experiment_start.set();
                    }
                }
                GateTransition::None => {
                    if self.gate.state() == GateState::Waiting {
                        self.io.signals.wait.set();
                    }
                }
            }
        }
    }

    fn resize_buffers(&mut self) {
        let length = match (self.mode, &self.parameters.z) {
            (ScanningMode::Volumetric, ZParameters::Scanning(z)) if z.frequency > MIN_RESIZE_FREQUENCY => {
                Some(samples_per_period(self.sample_rate, z.frequency))
            }
            (ScanningMode::TriggeredPlanar, _) => self
                .parameters
                .triggering
                .active_frequency()
                .map(|f| samples_per_period(self.sample_rate, f)),
            _ => None,
        };
        if let Some(length) = length {
            if length != self.camera_pulses.len() {
                self.recorded = FillingRollingBuffer::new(length);
                self.camera_pulses = RollingBuffer::new(length);
            }
        }
    }

    fn configure_mode(&mut self) {
        match (self.mode, &self.parameters.z) {
            (ScanningMode::Volumetric, ZParameters::Scanning(z)) => {
                let triggering = &self.parameters.triggering;
                set_impulses(
                    self.camera_pulses.as_mut_slice(),
                    triggering.n_planes,
                    triggering.n_skip_start,
                    triggering.n_skip_end,
                    CAMERA_PULSE_HIGH,
                );
                self.z_waveform = SawtoothWaveform::new(z.frequency, z.piezo_min, z.piezo_max);
            }
            (ScanningMode::TriggeredPlanar, _) => {
                set_impulses(self.camera_pulses.as_mut_slice(), 1, 0, 0, CAMERA_PULSE_HIGH);
            }
            _ => {}
        }
    }

    fn tick(&mut self) -> Result<(), HardwareError> {
        let t = time_vector(self.i_sample, self.n_samples, self.sample_rate);
        self.fill_xy(&t);
        match self.mode {
            ScanningMode::Volumetric => self.fill_volumetric(&t),
            ScanningMode::Planar => {
                self.fill_planar_z();
                self.board.fill_channel(ScanChannel::CameraTrigger, 0.0);
                self.io.signals.wait.clear();
            }
            ScanningMode::TriggeredPlanar => {
                self.fill_planar_z();
                self.fill_camera_trigger();
            }
            ScanningMode::Paused => {}
        }

        self.board.write()?;
        self.io.log.log_message("write");
        if !self.started {
            self.board.start()?;
            self.started = true;
        }
        self.board.read()?;
        self.io.log.log_message("read");
        self.n_samples_read += self.n_samples;

        if self.mode == ScanningMode::Volumetric {
            self.record_piezo();
        }

        self.i_sample = (self.i_sample + self.n_samples) % self.period;
        self.n_acquired += 1;
        tracing::trace!(i_sample = self.i_sample, tick = self.n_acquired, "scan tick");
        Ok(())
    }

    fn fill_xy(&mut self, t: &[f64]) {
        let lateral = self.lateral.values(t);
        let frontal = self.frontal.values(t);
        self.board.set_xy_lateral(&lateral);
        self.board.set_xy_frontal(&frontal);
    }

    fn fill_planar_z(&mut self) {
        let (piezo, lateral, frontal) = match &self.parameters.z {
            ZParameters::Manual(z) => (z.piezo, z.lateral, z.frontal),
            ZParameters::Synced(z) => (
                z.piezo,
                z.lateral_sync.apply(z.piezo),
                z.frontal_sync.apply(z.piezo),
            ),
            // rejected by validate()
            ZParameters::Scanning(_) => return,
        };
        self.board.fill_channel(ScanChannel::ZPiezo, piezo);
        self.board.fill_channel(ScanChannel::ZLateral, lateral);
        self.board.fill_channel(ScanChannel::ZFrontal, frontal);
    }

    fn fill_volumetric(&mut self, t: &[f64]) {
        let ZParameters::Scanning(z) = self.parameters.z else {
            return;
        };
        let piezo = self.z_waveform.values(t);
        self.board.set_z_piezo(&piezo);

        // Until the recording covers a full period the galvos keep their last values.
        if self.recorded.is_complete() && !self.recorded.is_empty() {
            let i = self.i_sample % self.recorded.len();
            let wave = self.recorded.read(i, self.n_samples);
            let (min, max) = wave
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            match synced_galvo(&wave, min, max, &z.lateral_sync) {
                Some(values) => self.board.set_z_lateral(&values),
                None => tracing::trace!("lateral sync outside safe range, keeping previous"),
            }
            match synced_galvo(&wave, min, max, &z.frontal_sync) {
                Some(values) => self.board.set_z_frontal(&values),
                None => tracing::trace!("frontal sync outside safe range, keeping previous"),
            }
        }

        self.fill_camera_trigger();
    }

    fn fill_camera_trigger(&mut self) {
        if self.camera_pulses.is_empty() {
            self.board.fill_channel(ScanChannel::CameraTrigger, 0.0);
            return;
        }
        let i = self.i_sample % self.camera_pulses.len();
        let tick = self
            .gate
            .pulses(&self.camera_pulses, i, self.n_samples, self.period);
        if tick.began {
            self.io.log.log_message("camera pulses begin");
        }
        if self.gate.state() == GateState::Running {
            self.io.signals.wait.clear();
        }
        self.board.set_camera_trigger(&tick.samples);
    }

    fn record_piezo(&mut self) {
        let len = self.recorded.len();
        if len == 0 {
            return;
        }
        let i_insert = (self.i_sample as i64 - self.n_samples as i64).rem_euclid(len as i64) as usize;
        let readback = self.board.piezo_readback();
        let n = readback.len().min(len);
        let chunk = readback[..n].to_vec();
        self.recorded.write(&chunk, i_insert);
        self.io.waveform.publish(self.recorded.as_slice().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Flag;
    use crate::events::DslmEvent;
    use crate::hardware::capabilities::BoardOpener;
    use crate::hardware::mock::{MockBoardOpener, MockBoardProbe};
    use crate::scanning::parameters::{ZManual, ZScanning, ZSynced};
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::Arc;

    const SR: f64 = 1_000.0;

    struct Rig {
        log: Arc<ConcurrenceLog>,
        signals: ScanSignals,
        tx: Sender<ScanParameters>,
        rx: Receiver<ScanParameters>,
        waveform: LatestQueue<Vec<f64>>,
        opener: MockBoardOpener,
        probe: MockBoardProbe,
    }

    impl Rig {
        fn new() -> Self {
            let log = ConcurrenceLog::disabled("scanner");
            let signals = ScanSignals {
                stop: LoggedFlag::new(DslmEvent::CloseAll, log.clone()),
                restart: LoggedFlag::new(DslmEvent::RestartScanning, log.clone()),
                wait: LoggedFlag::wrap(Flag::new(), DslmEvent::WaitingForTrigger, log.clone()),
                experiment_start: LoggedFlag::new(DslmEvent::ExperimentStart, log.clone()),
            };
            let (tx, rx) = unbounded();
            let opener = MockBoardOpener::new();
            let probe = opener.probe();
            Self {
                log,
                signals,
                tx,
                rx,
                waveform: LatestQueue::new(4),
                opener,
                probe,
            }
        }

        fn scan_loop(&self, params: ScanParameters, n_samples: usize) -> ScanLoop<'_> {
            // clones share the probe
            let board = self.opener.clone().open(SR, n_samples).unwrap();
            let io = ScanLoopIo {
                parameters: &self.rx,
                waveform: &self.waveform,
                signals: &self.signals,
                log: &self.log,
            };
            ScanLoop::new(board, io, params, SR)
        }
    }

    fn xy_100hz(params: &mut ScanParameters) {
        // 10 samples per xy period at 1 kHz
        params.xy.lateral.frequency = 100.0;
        params.xy.frontal.frequency = 100.0;
    }

    fn volumetric() -> ScanParameters {
        let mut params = ScanParameters {
            mode: ScanningMode::Volumetric,
            z: ZParameters::Scanning(ZScanning {
                piezo_min: 100.0,
                piezo_max: 200.0,
                frequency: 10.0, // 100 sample volumes
                lateral_sync: SyncCoefficients::new(0.0, 0.01),
                frontal_sync: SyncCoefficients::new(-1.0, 0.005),
            }),
            ..Default::default()
        };
        params.triggering.n_planes = 4;
        xy_100hz(&mut params);
        params
    }

    fn tick_n(scan_loop: &mut ScanLoop<'_>, n: usize) {
        for _ in 0..n {
            scan_loop.update_settings();
            assert_eq!(scan_loop.exit_condition(), None);
            scan_loop.tick().unwrap();
        }
    }

    #[test]
    fn test_planar_outputs() {
        let rig = Rig::new();
        let mut params = ScanParameters {
            mode: ScanningMode::Planar,
            z: ZParameters::Synced(ZSynced {
                piezo: 100.0,
                lateral_sync: SyncCoefficients::new(0.5, 0.01),
                frontal_sync: SyncCoefficients::new(0.0, -0.01),
            }),
            ..Default::default()
        };
        xy_100hz(&mut params);
        params.xy.lateral.vmin = -1.0;
        params.xy.lateral.vmax = 1.0;
        rig.signals.wait.set();
        let probe = rig.probe.clone();

        let mut scan_loop = rig.scan_loop(params, 20);
        tick_n(&mut scan_loop, 3);
        drop(scan_loop);

        let tick = probe.last_tick().unwrap();
        assert!(tick.get(ScanChannel::ZPiezo).iter().all(|&v| v == 100.0));
        assert!(tick.get(ScanChannel::ZLateral).iter().all(|&v| (v - 1.5).abs() < 1e-12));
        assert!(tick.get(ScanChannel::ZFrontal).iter().all(|&v| (v + 1.0).abs() < 1e-12));
        assert!(tick.get(ScanChannel::CameraTrigger).iter().all(|&v| v == 0.0));
        // triangle crosses mid-range rising every 10 samples
        let lateral = tick.get(ScanChannel::XyLateral);
        assert!(lateral[0].abs() < 1e-9);
        assert!(lateral[1] > lateral[0]);
        assert!(lateral[5].abs() < 1e-9);
        assert!(lateral[6] < lateral[5]);
        assert!(lateral[10].abs() < 1e-9);
        assert!(lateral.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(!rig.signals.wait.is_set());
        assert_eq!(probe.starts(), 1);
        assert_eq!(probe.sessions_closed(), 1);
    }

    #[test]
    fn test_volumetric_gate_and_sync() {
        let rig = Rig::new();
        let probe = rig.probe.clone();
        let mut scan_loop = rig.scan_loop(volumetric(), 50);
        assert!(rig.signals.wait.is_set());

        // 100 sample period, 50 samples per tick
        tick_n(&mut scan_loop, 3);
        assert_eq!(scan_loop.gate_state(), GateState::Waiting);
        assert!(!rig.signals.experiment_start.is_set());

        // more than one period read: camera on, but this tick starts mid-period
        tick_n(&mut scan_loop, 1);
        assert_eq!(scan_loop.gate_state(), GateState::Armed);
        assert!(rig.signals.experiment_start.is_set());
        assert!(rig.signals.wait.is_set());

        // next tick starts on the period boundary: pulses pass
        tick_n(&mut scan_loop, 1);
        assert_eq!(scan_loop.gate_state(), GateState::Running);
        assert!(!rig.signals.wait.is_set());

        let tick = probe.last_tick().unwrap();
        let trigger = tick.get(ScanChannel::CameraTrigger);
        let pulses: Vec<usize> = (0..50).filter(|&i| trigger[i] == 5.0).collect();
        assert_eq!(pulses, vec![0, 25]);

        // recording complete: lateral galvo follows the recorded piezo
        let lateral = tick.get(ScanChannel::ZLateral);
        assert!(lateral.iter().all(|&v| (1.0..=2.0).contains(&v)));
        assert!(rig.waveform.latest().is_some_and(|w| w.len() == 100));
        drop(scan_loop);
    }

    #[test]
    fn test_unsafe_calibration_keeps_previous_galvo_values() {
        let rig = Rig::new();
        let probe = rig.probe.clone();
        let mut params = volumetric();
        if let ZParameters::Scanning(z) = &mut params.z {
            // 100..200 um maps to 5..10 V
            z.lateral_sync = SyncCoefficients::new(0.0, 0.05);
        }
        let mut scan_loop = rig.scan_loop(params, 50);
        tick_n(&mut scan_loop, 8);
        drop(scan_loop);

        let lateral = probe.channel_history(ScanChannel::ZLateral);
        assert!(lateral.iter().all(|&v| v == 0.0));
        let frontal = probe.channel_history(ScanChannel::ZFrontal);
        assert!(frontal.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_parameter_change_reinitializes() {
        let rig = Rig::new();
        let tx = rig.tx.clone();
        let mut scan_loop = rig.scan_loop(volumetric(), 50);
        tick_n(&mut scan_loop, 5);
        assert_eq!(scan_loop.gate_state(), GateState::Running);

        let mut changed = volumetric();
        if let ZParameters::Scanning(z) = &mut changed.z {
            z.frequency = 5.0;
        }
        tx.send(changed).unwrap();
        tick_n(&mut scan_loop, 1);
        assert_eq!(scan_loop.gate_state(), GateState::Waiting);
        assert_eq!(scan_loop.period, 200);
        assert_eq!(scan_loop.recorded.len(), 200);
        assert!(rig.signals.wait.is_set());
        drop(scan_loop);
    }

    #[test]
    fn test_restart_flag_consumed_on_exit() {
        let rig = Rig::new();
        rig.signals.restart.set();
        let mut params = ScanParameters {
            mode: ScanningMode::Planar,
            z: ZParameters::Manual(ZManual::default()),
            ..Default::default()
        };
        xy_100hz(&mut params);
        let mut scan_loop = rig.scan_loop(params, 10);
        assert_eq!(scan_loop.run(), Ok(LoopExit::Restart));
        assert_eq!(scan_loop.gate_state(), GateState::Stopped);
        drop(scan_loop);
        assert!(!rig.signals.restart.is_set());
    }

    #[test]
    fn test_mode_change_exits() {
        let rig = Rig::new();
        let tx = rig.tx.clone();
        let mut scan_loop = rig.scan_loop(volumetric(), 50);
        tx.send(ScanParameters::default()).unwrap();
        assert_eq!(scan_loop.run(), Ok(LoopExit::ModeChanged(ScanningMode::Paused)));
        assert_eq!(scan_loop.parameters().mode, ScanningMode::Paused);
        drop(scan_loop);
    }

    #[test]
    fn test_hardware_fault_propagates() {
        let rig = Rig::new();
        rig.probe
            .inject_fault(2, HardwareError::Dma("underrun".into()));
        let mut scan_loop = rig.scan_loop(volumetric(), 50);
        assert_eq!(scan_loop.run(), Err(HardwareError::Dma("underrun".into())));
        assert_eq!(scan_loop.ticks(), 2);
        drop(scan_loop);
    }
}
