//! Cross-worker control flags with edge-triggered audit logging.
//!
//! Bulk data moves between workers over channels (see [`crate::queue`]); control moves
//! over flags. A [`Flag`] is a shared atomic boolean. A [`LoggedFlag`] wraps one with a
//! per-handle memory of the last value it saw, so that each transition is written to the
//! owning worker's [`ConcurrenceLog`] exactly once:
//!
//! - `set`/`clear` log a *sent* transition when they change the handle's view,
//! - `is_set` logs a *received* transition when it observes a change made elsewhere.
//!
//! Every worker holds its own handle (`new_reference`) bound to its own log, which is
//! what makes the per-worker log files comparable when diagnosing timing between
//! subsystems.

use crate::error::AppResult;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Named control signals shared between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DslmEvent {
    /// Scanner is preparing; frames arriving now must be discarded.
    WaitingForTrigger,
    /// Tear down and rebuild the scan loop with fresh hardware tasks.
    RestartScanning,
    /// First synchronized camera pulse of an experiment has been emitted.
    ExperimentStart,
    /// Completed volumes go to the saver.
    IsSaving,
    /// Saver finished (or aborted) its session.
    SavingStopped,
    /// Dispatcher subtracts the noise reference from every frame.
    NoiseSubtractionActive,
    /// Shared shutdown signal.
    CloseAll,
}

impl DslmEvent {
    /// Stable identifier used in the concurrence log.
    pub fn name(&self) -> &'static str {
        match self {
            DslmEvent::WaitingForTrigger => "WAITING_FOR_TRIGGER",
            DslmEvent::RestartScanning => "RESTART_SCANNING",
            DslmEvent::ExperimentStart => "EXPERIMENT_START",
            DslmEvent::IsSaving => "IS_SAVING",
            DslmEvent::SavingStopped => "SAVING_STOPPED",
            DslmEvent::NoiseSubtractionActive => "NOISE_SUBTRACTION_ACTIVE",
            DslmEvent::CloseAll => "CLOSE_ALL",
        }
    }
}

impl fmt::Display for DslmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds on the process-wide monotonic clock shared by all workers.
pub fn monotonic_ns() -> u128 {
    epoch().elapsed().as_nanos()
}

/// Per-worker timing log.
///
/// Each line is `monotonic_ns,KIND,id,is_sender,value`. Entries are mirrored to
/// `tracing` at trace level, so a disabled log still leaves a trail when
/// `RUST_LOG=trace`.
pub struct ConcurrenceLog {
    worker: String,
    file: Mutex<Option<BufWriter<File>>>,
}

impl fmt::Debug for ConcurrenceLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrenceLog")
            .field("worker", &self.worker)
            .field("to_file", &self.file.lock().is_some())
            .finish()
    }
}

impl ConcurrenceLog {
    /// Log to `<dir>/<worker>.txt`, truncating a previous run's file.
    pub fn to_dir(worker: &str, dir: &Path) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(dir.join(format!("{worker}.txt")))?;
        epoch();
        Ok(Arc::new(Self {
            worker: worker.to_string(),
            file: Mutex::new(Some(BufWriter::new(file))),
        }))
    }

    /// Log only through `tracing`.
    pub fn disabled(worker: &str) -> Arc<Self> {
        epoch();
        Arc::new(Self {
            worker: worker.to_string(),
            file: Mutex::new(None),
        })
    }

    /// Name of the worker owning this log.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    fn write_entry(&self, kind: &str, id: &str, is_sender: bool, value: &str) {
        let ns = monotonic_ns();
        tracing::trace!(
            worker = %self.worker,
            t_ns = ns as u64,
            kind,
            id,
            is_sender,
            value,
            "concurrence"
        );

        let mut guard = self.file.lock();
        if let Some(writer) = guard.as_mut() {
            let line = format!("{ns},{kind},{id},{},{value}\n", u8::from(is_sender));
            if let Err(e) = writer.write_all(line.as_bytes()) {
                tracing::warn!(worker = %self.worker, error = %e, "concurrence log disabled after write failure");
                *guard = None;
            }
        }
    }

    /// Log a free-form message.
    pub fn log_message(&self, message: &str) {
        self.write_entry("LOG", message, false, "0");
    }

    /// Log a flag transition.
    pub fn log_event(&self, event: DslmEvent, is_sender: bool, value: bool) {
        self.write_entry("EVENT", event.name(), is_sender, if value { "1" } else { "0" });
    }

    /// Log a queue operation.
    pub fn log_queue(&self, queue: &str, is_sender: bool) {
        self.write_entry("QUEUE", queue, is_sender, "1");
    }

    /// Flush buffered lines to disk.
    pub fn flush(&self) {
        if let Some(writer) = self.file.lock().as_mut() {
            if let Err(e) = writer.flush() {
                tracing::warn!(worker = %self.worker, error = %e, "failed to flush concurrence log");
            }
        }
    }
}

impl Drop for ConcurrenceLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Shared atomic boolean.
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    /// New flag, initially clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Current value.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A [`Flag`] handle that logs its transitions.
#[derive(Debug)]
pub struct LoggedFlag {
    flag: Flag,
    event: DslmEvent,
    log: Arc<ConcurrenceLog>,
    was_set: AtomicBool,
}

impl LoggedFlag {
    /// Create a new, clear flag.
    pub fn new(event: DslmEvent, log: Arc<ConcurrenceLog>) -> Self {
        Self::wrap(Flag::new(), event, log)
    }

    /// Attach logging to an existing shared flag.
    pub fn wrap(flag: Flag, event: DslmEvent, log: Arc<ConcurrenceLog>) -> Self {
        let was_set = AtomicBool::new(flag.is_set());
        Self {
            flag,
            event,
            log,
            was_set,
        }
    }

    /// Another handle on the same flag, logging into `log`.
    pub fn new_reference(&self, log: Arc<ConcurrenceLog>) -> Self {
        Self::wrap(self.flag.clone(), self.event, log)
    }

    /// The event this flag carries.
    pub fn event(&self) -> DslmEvent {
        self.event
    }

    /// Raise the flag, logging if this handle saw it clear.
    pub fn set(&self) {
        self.flag.set();
        if !self.was_set.swap(true, Ordering::SeqCst) {
            self.log.log_event(self.event, true, true);
        }
    }

    /// Lower the flag, logging if this handle saw it set.
    pub fn clear(&self) {
        self.flag.clear();
        if self.was_set.swap(false, Ordering::SeqCst) {
            self.log.log_event(self.event, true, false);
        }
    }

    /// Read the flag, logging a transition made by another handle.
    pub fn is_set(&self) -> bool {
        let value = self.flag.is_set();
        if self.was_set.swap(value, Ordering::SeqCst) != value {
            self.log.log_event(self.event, false, value);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_flag_shared_between_clones() {
        let flag = Flag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
        other.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_logged_flag_logs_edges_only() {
        let dir = tempfile::tempdir().unwrap();
        let sender_log = ConcurrenceLog::to_dir("main", dir.path()).unwrap();
        let receiver_log = ConcurrenceLog::to_dir("dispatcher", dir.path()).unwrap();

        let sender = LoggedFlag::new(DslmEvent::IsSaving, sender_log.clone());
        let receiver = sender.new_reference(receiver_log.clone());

        sender.set();
        sender.set(); // no second entry
        assert!(receiver.is_set());
        assert!(receiver.is_set()); // no second entry
        sender.clear();
        assert!(!receiver.is_set());

        sender_log.flush();
        receiver_log.flush();

        let sent = read_lines(&dir.path().join("main.txt"));
        assert_eq!(sent.len(), 2);
        assert!(sent[0].ends_with(",EVENT,IS_SAVING,1,1"));
        assert!(sent[1].ends_with(",EVENT,IS_SAVING,1,0"));

        let received = read_lines(&dir.path().join("dispatcher.txt"));
        assert_eq!(received.len(), 2);
        assert!(received[0].ends_with(",EVENT,IS_SAVING,0,1"));
        assert!(received[1].ends_with(",EVENT,IS_SAVING,0,0"));
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConcurrenceLog::to_dir("scanner", dir.path()).unwrap();
        for i in 0..10 {
            log.log_message(&format!("tick {i}"));
        }
        log.flush();

        let stamps: Vec<u128> = read_lines(&dir.path().join("scanner.txt"))
            .iter()
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(stamps.len(), 10);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reference_starts_from_current_value() {
        let log = ConcurrenceLog::disabled("test");
        let flag = LoggedFlag::new(DslmEvent::CloseAll, log.clone());
        flag.set();
        let reference = flag.new_reference(log);
        assert!(reference.is_set());
        reference.clear();
        assert!(!flag.is_set());
    }
}
