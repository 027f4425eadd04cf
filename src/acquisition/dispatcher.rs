//! Volume assembly.
//!
//! Frames from the camera queue are stacked plane by plane into a volume buffer
//! `[n_planes, height, width]`. Each completed volume goes to the viewer queue when it
//! has room, and to the saver queue while saving. While the scanner is waiting for its
//! trigger gate, incoming frames do not belong to any volume and are discarded; the next
//! volume then starts again at plane 0.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use ndarray::{Array3, Axis, Zip};

use crate::error::{AppResult, DslmError};
use crate::events::{ConcurrenceLog, LoggedFlag};
use crate::hardware::{Frame, Volume};
use crate::queue::{drain, offer, recv_timeout, send_until, try_recv_latest};

/// `max(frame - reference, 0)` element-wise.
///
/// A reference of another shape leaves the frame unchanged.
pub fn neg_dif(frame: &Frame, reference: &Frame) -> Frame {
    if frame.dim() != reference.dim() {
        return frame.clone();
    }
    Zip::from(frame)
        .and(reference)
        .map_collect(|&x, &r| x.saturating_sub(r))
}

/// Queues the dispatcher publishes to.
#[derive(Debug, Clone)]
pub struct DispatcherOutputs {
    /// Display volumes, bounded and lossy
    pub viewer: Sender<Volume>,
    /// Volumes to save, never dropped
    pub saver: Sender<Volume>,
    /// Receiving end of the saver queue, used to discard stale volumes
    pub saver_drain: Receiver<Volume>,
}

/// Flags the dispatcher reads.
#[derive(Debug)]
pub struct DispatcherSignals {
    /// Shared shutdown
    pub stop: LoggedFlag,
    /// Frames arriving now are not part of a volume
    pub wait: LoggedFlag,
    /// Completed volumes go to the saver
    pub is_saving: LoggedFlag,
    /// Subtract the noise reference from every frame
    pub noise_subtraction: LoggedFlag,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Volumes completed
    pub volumes: u64,
    /// Volumes not shown because the viewer queue was full
    pub viewer_dropped: u64,
    /// Volumes handed to the saver
    pub saved: u64,
    /// Frames discarded while waiting
    pub discarded: u64,
}

/// Volume assembly state.
#[derive(Debug)]
pub struct VolumeDispatcher {
    outputs: DispatcherOutputs,
    signals: DispatcherSignals,
    log: Arc<ConcurrenceLog>,
    poll_timeout: Duration,
    n_planes: usize,
    i_plane: usize,
    first_volume: bool,
    volume: Option<Volume>,
    reference: Option<Frame>,
    stats: DispatcherStats,
}

impl VolumeDispatcher {
    /// Dispatcher assembling single-plane volumes until told otherwise.
    pub fn new(
        outputs: DispatcherOutputs,
        signals: DispatcherSignals,
        log: Arc<ConcurrenceLog>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            outputs,
            signals,
            log,
            poll_timeout,
            n_planes: 1,
            i_plane: 0,
            first_volume: true,
            volume: None,
            reference: None,
            stats: DispatcherStats::default(),
        }
    }

    /// Planes per volume.
    pub fn n_planes(&self) -> usize {
        self.n_planes
    }

    /// Plane slot the next frame goes to.
    pub fn i_plane(&self) -> usize {
        self.i_plane
    }

    /// Counters so far.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// Change the volume size; the current partial volume is abandoned.
    pub fn set_n_planes(&mut self, n_planes: usize) {
        self.n_planes = n_planes.max(1);
        self.first_volume = true;
        self.i_plane = 0;
        tracing::debug!(n_planes = self.n_planes, "dispatcher volume size changed");
    }

    /// Replace the noise reference image.
    pub fn set_reference(&mut self, reference: Frame) {
        self.reference = Some(reference);
    }

    /// Apply the newest queued settings.
    pub fn update_settings(&mut self, n_planes: &Receiver<usize>, reference: &Receiver<Frame>) {
        if let Some(n) = try_recv_latest(n_planes) {
            self.log.log_queue("n_planes", false);
            self.set_n_planes(n);
        }
        if let Some(frame) = try_recv_latest(reference) {
            self.log.log_queue("noise_reference", false);
            self.set_reference(frame);
        }
    }

    /// Place one frame into the volume being assembled.
    ///
    /// Returns `true` when the frame completed a volume.
    pub fn process_frame(&mut self, frame: Frame) -> bool {
        let frame = match &self.reference {
            Some(reference) if self.signals.noise_subtraction.is_set() => neg_dif(&frame, reference),
            _ => frame,
        };

        let (height, width) = frame.dim();
        let reallocate = match &self.volume {
            Some(volume) if !self.first_volume => {
                volume.dim() != (self.n_planes, height, width)
            }
            _ => true,
        };
        if reallocate {
            self.volume = Some(Array3::zeros((self.n_planes, height, width)));
            self.first_volume = false;
            self.i_plane = 0;
            tracing::debug!(n_planes = self.n_planes, height, width, "volume buffer allocated");
        }

        let Some(volume) = self.volume.as_mut() else {
            return false;
        };
        volume.index_axis_mut(Axis(0), self.i_plane).assign(&frame);
        self.log.log_message(&format!("received plane {}", self.i_plane));
        self.i_plane += 1;

        if self.i_plane == self.n_planes {
            self.i_plane = 0;
            let completed = volume.clone();
            self.fill_queues(completed);
            true
        } else {
            false
        }
    }

    fn fill_queues(&mut self, volume: Volume) {
        self.stats.volumes += 1;
        let saving = self.signals.is_saving.is_set();
        let for_saver = saving.then(|| volume.clone());

        if offer(&self.outputs.viewer, volume) {
            self.log.log_queue("viewer", true);
        } else {
            self.stats.viewer_dropped += 1;
        }

        if let Some(volume) = for_saver {
            let stop = &self.signals.stop;
            if send_until(&self.outputs.saver, volume, self.poll_timeout, || stop.is_set()) {
                self.stats.saved += 1;
                self.log.log_queue("saver", true);
            }
        }
        tracing::debug!(volume = self.stats.volumes, saving, "volume complete");
    }

    /// Discard frames until the wait flag clears, then realign to plane 0.
    ///
    /// Volumes queued for the saver at this point belong to the aborted configuration
    /// and are dropped too.
    pub fn wait_and_drain(&mut self, camera: &Receiver<Frame>) {
        self.log.log_message("wait starting");
        let stale = drain(&self.outputs.saver_drain);
        if stale > 0 {
            tracing::debug!(stale, "discarded queued volumes at wait start");
        }
        while self.signals.wait.is_set() && !self.signals.stop.is_set() {
            if recv_timeout(camera, self.poll_timeout).is_some() {
                self.stats.discarded += 1;
            }
        }
        self.stats.discarded += drain(camera) as u64;
        self.i_plane = 0;
        self.log.log_message("wait over");
    }

    /// One dispatcher iteration: honour the wait flag, then take at most one frame.
    pub fn poll(&mut self, camera: &Receiver<Frame>) -> bool {
        if self.signals.wait.is_set() {
            self.wait_and_drain(camera);
        }
        match recv_timeout(camera, self.poll_timeout) {
            Some(frame) => self.process_frame(frame),
            None => false,
        }
    }
}

/// Everything the dispatcher thread owns.
#[derive(Debug)]
pub struct DispatcherContext {
    /// Assembly state and outputs
    pub dispatcher: VolumeDispatcher,
    /// Raw frames from the camera
    pub camera: Receiver<Frame>,
    /// Volume size updates
    pub n_planes: Receiver<usize>,
    /// Noise reference updates
    pub reference: Receiver<Frame>,
}

/// Run the dispatcher until the stop flag is set.
pub fn run_dispatcher(ctx: DispatcherContext) -> DispatcherStats {
    let DispatcherContext {
        mut dispatcher,
        camera,
        n_planes,
        reference,
    } = ctx;
    dispatcher.log.log_message("started");
    tracing::info!("dispatcher started");

    while !dispatcher.signals.stop.is_set() {
        dispatcher.update_settings(&n_planes, &reference);
        dispatcher.poll(&camera);
    }

    dispatcher.log.log_message("stopped");
    dispatcher.log.flush();
    tracing::info!(stats = ?dispatcher.stats, "dispatcher stopped");
    dispatcher.stats
}

/// Spawn [`run_dispatcher`] on a named thread.
pub fn spawn_dispatcher(ctx: DispatcherContext) -> AppResult<JoinHandle<DispatcherStats>> {
    thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || run_dispatcher(ctx))
        .map_err(|e| DslmError::Worker(format!("failed to spawn dispatcher: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DslmEvent;
    use crossbeam_channel::{bounded, unbounded};
    use ndarray::Array2;
    use proptest::prelude::*;

    struct Rig {
        dispatcher: VolumeDispatcher,
        viewer: Receiver<Volume>,
        saver: Receiver<Volume>,
        camera_tx: Sender<Frame>,
        camera: Receiver<Frame>,
        wait: LoggedFlag,
        is_saving: LoggedFlag,
        noise: LoggedFlag,
    }

    fn rig(n_planes: usize) -> Rig {
        let log = ConcurrenceLog::disabled("dispatcher");
        let (viewer_tx, viewer) = bounded(3);
        let (saver_tx, saver) = bounded(16);
        let (camera_tx, camera) = unbounded();
        let wait = LoggedFlag::new(DslmEvent::WaitingForTrigger, log.clone());
        let is_saving = LoggedFlag::new(DslmEvent::IsSaving, log.clone());
        let noise = LoggedFlag::new(DslmEvent::NoiseSubtractionActive, log.clone());
        let signals = DispatcherSignals {
            stop: LoggedFlag::new(DslmEvent::CloseAll, log.clone()),
            wait: wait.new_reference(log.clone()),
            is_saving: is_saving.new_reference(log.clone()),
            noise_subtraction: noise.new_reference(log.clone()),
        };
        let outputs = DispatcherOutputs {
            viewer: viewer_tx,
            saver: saver_tx,
            saver_drain: saver.clone(),
        };
        let mut dispatcher =
            VolumeDispatcher::new(outputs, signals, log, Duration::from_millis(1));
        dispatcher.set_n_planes(n_planes);
        Rig {
            dispatcher,
            viewer,
            saver,
            camera_tx,
            camera,
            wait,
            is_saving,
            noise,
        }
    }

    fn frame(value: u16) -> Frame {
        Array2::from_elem((4, 6), value)
    }

    proptest! {
        #[test]
        fn prop_neg_dif_saturates(x in any::<u16>(), r in any::<u16>()) {
            let out = neg_dif(&Array2::from_elem((2, 2), x), &Array2::from_elem((2, 2), r));
            let expected = if x >= r { x - r } else { 0 };
            prop_assert!(out.iter().all(|&v| v == expected));
        }
    }

    #[test]
    fn test_seven_frames_make_two_volumes() {
        let mut rig = rig(3);
        let completed: Vec<bool> = (1..=7).map(|i| rig.dispatcher.process_frame(frame(i))).collect();
        assert_eq!(completed, vec![false, false, true, false, false, true, false]);
        assert_eq!(rig.dispatcher.i_plane(), 1);

        let volumes: Vec<Volume> = rig.viewer.try_iter().collect();
        assert_eq!(volumes.len(), 2);
        for (volume, first) in volumes.iter().zip([1u16, 4]) {
            assert_eq!(volume.dim(), (3, 4, 6));
            for plane in 0..3 {
                assert!(volume
                    .index_axis(Axis(0), plane)
                    .iter()
                    .all(|&v| v == first + plane as u16));
            }
        }
        // not saving
        assert!(rig.saver.is_empty());
    }

    #[test]
    fn test_viewer_drops_when_three_pending() {
        let mut rig = rig(1);
        rig.is_saving.set();
        for i in 0..5 {
            rig.dispatcher.process_frame(frame(i));
        }
        assert_eq!(rig.viewer.len(), 3);
        assert_eq!(rig.saver.len(), 5);
        assert_eq!(rig.dispatcher.stats().viewer_dropped, 2);
    }

    #[test]
    fn test_wait_discards_frames_and_resets_plane() {
        let mut rig = rig(3);
        rig.dispatcher.process_frame(frame(1));
        rig.dispatcher.process_frame(frame(2));
        assert_eq!(rig.dispatcher.i_plane(), 2);

        rig.is_saving.set();
        rig.dispatcher.process_frame(frame(3));
        assert_eq!(rig.saver.len(), 1);

        for i in 100..105 {
            rig.camera_tx.send(frame(i)).unwrap();
        }
        rig.dispatcher.process_frame(frame(4));
        rig.wait.set();
        let wait = rig.wait.new_reference(ConcurrenceLog::disabled("test"));
        let clearer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            wait.clear();
        });
        rig.dispatcher.poll(&rig.camera);
        clearer.join().unwrap();

        assert_eq!(rig.dispatcher.i_plane(), 0);
        assert_eq!(rig.dispatcher.stats().discarded, 5);
        // stale saver volume dropped
        assert!(rig.saver.is_empty());

        for i in 10..13 {
            rig.dispatcher.process_frame(frame(i));
        }
        let volume = rig.saver.try_recv().unwrap();
        assert!(volume.index_axis(Axis(0), 0).iter().all(|&v| v == 10));
        assert!(volume.iter().all(|&v| v < 100));
    }

    #[test]
    fn test_shape_change_reallocates() {
        let mut rig = rig(2);
        rig.dispatcher.process_frame(frame(1));
        let wide = Array2::from_elem((4, 8), 7u16);
        assert!(!rig.dispatcher.process_frame(wide.clone()));
        assert!(rig.dispatcher.process_frame(wide));
        let volume = rig.viewer.try_recv().unwrap();
        assert_eq!(volume.dim(), (2, 4, 8));
    }

    #[test]
    fn test_n_planes_update_resets() {
        let mut rig = rig(3);
        let (n_tx, n_rx) = unbounded();
        let (_ref_tx, ref_rx) = unbounded();
        rig.dispatcher.process_frame(frame(1));
        n_tx.send(4).unwrap();
        n_tx.send(2).unwrap();
        rig.dispatcher.update_settings(&n_rx, &ref_rx);
        assert_eq!(rig.dispatcher.n_planes(), 2);
        assert_eq!(rig.dispatcher.i_plane(), 0);
        rig.dispatcher.process_frame(frame(5));
        assert!(rig.dispatcher.process_frame(frame(6)));
        assert_eq!(rig.viewer.try_recv().unwrap().dim(), (2, 4, 6));
    }

    #[test]
    fn test_noise_subtraction_only_when_active() {
        let mut rig = rig(1);
        let (_n_tx, n_rx) = unbounded();
        let (ref_tx, ref_rx) = unbounded();
        ref_tx.send(frame(30)).unwrap();
        rig.dispatcher.update_settings(&n_rx, &ref_rx);

        rig.dispatcher.process_frame(frame(100));
        assert!(rig.viewer.try_recv().unwrap().iter().all(|&v| v == 100));

        rig.noise.set();
        rig.dispatcher.process_frame(frame(100));
        assert!(rig.viewer.try_recv().unwrap().iter().all(|&v| v == 70));
        rig.dispatcher.process_frame(frame(10));
        assert!(rig.viewer.try_recv().unwrap().iter().all(|&v| v == 0));
    }
}
