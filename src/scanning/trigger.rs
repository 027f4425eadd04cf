//! Camera trigger gate.
//!
//! After a (re)initialization the scan loop must run at least one full scan period
//! before the camera may be triggered, so that the piezo recording is complete and the
//! galvos are synchronized. The gate then waits for the next period boundary before
//! passing pulses, so the first volume always starts on plane 0.
//!
//! ```text
//! Waiting --(more than one period read)--> Armed --(period boundary)--> Running
//!    ^                                                                     |
//!    +------------------------------ reset --------------------------------+
//! ```
//!
//! `Stopped` is terminal and entered when the scan loop exits.

use crate::data::rolling_buffer::RollingBuffer;

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Camera off, waiting for the scan to settle
    Waiting,
    /// Camera on, pulses masked until the next period boundary
    Armed,
    /// Pulses pass through
    Running,
    /// Loop exited
    Stopped,
}

/// Outcome of [`CameraTrigger::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// Nothing changed
    None,
    /// Camera switched on; `first` is true only the first time for this gate
    Armed {
        /// First arming since the gate was created
        first: bool,
    },
}

/// Camera pulses of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPulses {
    /// Trigger samples to write
    pub samples: Vec<f64>,
    /// True on the tick where pulses first pass through
    pub began: bool,
}

/// Camera trigger state machine.
#[derive(Debug, Clone)]
pub struct CameraTrigger {
    state: GateState,
    has_armed: bool,
}

impl Default for CameraTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraTrigger {
    /// New gate in `Waiting`.
    pub fn new() -> Self {
        Self {
            state: GateState::Waiting,
            has_armed: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Whether the camera has been switched on.
    pub fn camera_on(&self) -> bool {
        matches!(self.state, GateState::Armed | GateState::Running)
    }

    /// Back to `Waiting`; the camera goes off until the scan settles again.
    pub fn reset(&mut self) {
        if self.state != GateState::Stopped {
            self.state = GateState::Waiting;
        }
    }

    /// Enter the terminal state.
    pub fn stop(&mut self) {
        self.state = GateState::Stopped;
    }

    /// Arm once more than `period` samples have been read since the last reset.
    pub fn update(&mut self, n_samples_read: usize, period: usize) -> GateTransition {
        if self.state == GateState::Waiting && n_samples_read > period {
            self.state = GateState::Armed;
            let first = !self.has_armed;
            self.has_armed = true;
            GateTransition::Armed { first }
        } else {
            GateTransition::None
        }
    }

    /// Pulses for the tick starting at `i_sample` (already reduced modulo the pulse
    /// buffer), `n` samples long, in a scan of `period` samples.
    ///
    /// When armed mid-period, samples before the next period boundary are zeroed; if the
    /// boundary is not reached within this tick, the whole tick is zero.
    pub fn pulses(
        &mut self,
        pulse_buffer: &RollingBuffer,
        i_sample: usize,
        n: usize,
        period: usize,
    ) -> TickPulses {
        match self.state {
            GateState::Waiting | GateState::Stopped => TickPulses {
                samples: vec![0.0; n],
                began: false,
            },
            GateState::Running => TickPulses {
                samples: pulse_buffer.read(i_sample, n),
                began: false,
            },
            GateState::Armed => {
                if i_sample == 0 {
                    self.state = GateState::Running;
                    return TickPulses {
                        samples: pulse_buffer.read(i_sample, n),
                        began: true,
                    };
                }
                let n_to_next = period.saturating_sub(i_sample);
                if n_to_next < n {
                    let mut samples = pulse_buffer.read(i_sample, n);
                    samples[..n_to_next].fill(0.0);
                    self.state = GateState::Running;
                    TickPulses {
                        samples,
                        began: true,
                    }
                } else {
                    TickPulses {
                        samples: vec![0.0; n],
                        began: false,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_buffer() -> RollingBuffer {
        // pulse every 10 samples over a 40 sample period
        let mut buf = RollingBuffer::new(40);
        crate::waveforms::set_impulses(buf.as_mut_slice(), 4, 0, 0, 5.0);
        buf
    }

    #[test]
    fn test_waits_for_more_than_one_period() {
        let mut gate = CameraTrigger::new();
        assert_eq!(gate.update(40, 40), GateTransition::None);
        assert_eq!(gate.state(), GateState::Waiting);
        assert_eq!(gate.update(41, 40), GateTransition::Armed { first: true });
        assert!(gate.camera_on());
        assert_eq!(gate.update(100, 40), GateTransition::None);
    }

    #[test]
    fn test_first_arming_reported_once() {
        let mut gate = CameraTrigger::new();
        gate.update(50, 40);
        gate.reset();
        assert!(!gate.camera_on());
        assert_eq!(gate.update(50, 40), GateTransition::Armed { first: false });
    }

    #[test]
    fn test_armed_at_boundary_passes_pulses() {
        let buf = pulse_buffer();
        let mut gate = CameraTrigger::new();
        gate.update(50, 40);
        let tick = gate.pulses(&buf, 0, 20, 40);
        assert!(tick.began);
        assert_eq!(tick.samples[0], 5.0);
        assert_eq!(tick.samples[10], 5.0);
        assert_eq!(gate.state(), GateState::Running);
    }

    #[test]
    fn test_armed_mid_period_masks_until_boundary() {
        let buf = pulse_buffer();
        let mut gate = CameraTrigger::new();
        gate.update(50, 40);

        // boundary not reached in this tick: all zero, still armed
        let tick = gate.pulses(&buf, 5, 20, 40);
        assert!(!tick.began);
        assert!(tick.samples.iter().all(|&v| v == 0.0));
        assert_eq!(gate.state(), GateState::Armed);

        // boundary 10 samples into the tick: pulse at 30 masked, pulse at 0 kept
        let tick = gate.pulses(&buf, 30, 20, 40);
        assert!(tick.began);
        assert!(tick.samples[..10].iter().all(|&v| v == 0.0));
        assert_eq!(tick.samples[10], 5.0);
        assert_eq!(gate.state(), GateState::Running);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let buf = pulse_buffer();
        let mut gate = CameraTrigger::new();
        gate.stop();
        gate.reset();
        assert_eq!(gate.state(), GateState::Stopped);
        assert_eq!(gate.update(1000, 40), GateTransition::None);
        assert!(gate.pulses(&buf, 0, 4, 40).samples.iter().all(|&v| v == 0.0));
    }
}
