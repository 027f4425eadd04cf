//! Scanner worker.
//!
//! Owns the paused/active transition. While paused it only drains parameter updates.
//! In an active mode it opens a board session, runs a [`ScanLoop`] until it exits, and
//! starts over with the loop's latest parameters. Hardware faults end one iteration
//! only: the session is dropped (closing the board) and a fresh one is opened.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::{AppResult, DslmError};
use crate::events::ConcurrenceLog;
use crate::hardware::capabilities::BoardOpener;
use crate::queue::{recv_latest_timeout, LatestQueue};
use crate::scanning::parameters::{ScanParameters, ScanningMode};
use crate::scanning::scan_loop::{LoopExit, ScanLoop, ScanLoopIo, ScanSignals};

/// Everything the scanner thread owns.
pub struct ScannerContext {
    /// Opens board sessions
    pub opener: Box<dyn BoardOpener>,
    /// Incoming parameters
    pub parameters: Receiver<ScanParameters>,
    /// Recorded piezo waveform for display
    pub waveform: LatestQueue<Vec<f64>>,
    /// Control flags
    pub signals: ScanSignals,
    /// Scanner concurrence log
    pub log: Arc<ConcurrenceLog>,
    /// Analog sample rate, Hz
    pub sample_rate: f64,
    /// Samples per tick
    pub n_samples: usize,
    /// Poll timeout while paused
    pub poll_timeout: Duration,
}

impl std::fmt::Debug for ScannerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerContext")
            .field("sample_rate", &self.sample_rate)
            .field("n_samples", &self.n_samples)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Counters reported when the scanner exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerStats {
    /// Board sessions opened
    pub sessions: usize,
    /// Hardware faults recovered from
    pub faults: usize,
    /// Loop exits on the restart signal
    pub restarts: usize,
}

/// Run the scanner until the stop flag is set.
pub fn run_scanner(ctx: ScannerContext) -> ScannerStats {
    let ScannerContext {
        mut opener,
        parameters: rx,
        waveform,
        signals,
        log,
        sample_rate,
        n_samples,
        poll_timeout,
    } = ctx;
    let io = ScanLoopIo {
        parameters: &rx,
        waveform: &waveform,
        signals: &signals,
        log: &log,
    };

    log.log_message("started");
    tracing::info!(sample_rate, n_samples, "scanner started");

    let mut stats = ScannerStats::default();
    let mut parameters = ScanParameters::default();
    // Set when the current parameters cannot run; cleared by the next update.
    let mut rejected = false;

    while !signals.stop.is_set() {
        if parameters.mode == ScanningMode::Paused || rejected {
            if let Some(new) = recv_latest_timeout(&rx, poll_timeout) {
                log.log_queue("scan_parameters", false);
                parameters = new;
                rejected = false;
            }
            continue;
        }

        if let Err(e) = parameters.validate() {
            tracing::warn!(error = %e, mode = ?parameters.mode, "scan parameters rejected, idling");
            log.log_message("parameters rejected");
            rejected = true;
            continue;
        }

        let board = match opener.open(sample_rate, n_samples) {
            Ok(board) => board,
            Err(e) => {
                tracing::warn!(error = %e, "could not open scan board, retrying");
                stats.faults += 1;
                thread::sleep(poll_timeout);
                continue;
            }
        };
        stats.sessions += 1;

        let mut scan_loop = ScanLoop::new(board, io, parameters, sample_rate);
        match scan_loop.run() {
            Ok(LoopExit::Restart) => stats.restarts += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, mode = ?parameters.mode, "scan board fault, reopening");
                log.log_message(&format!("board error {e}"));
                stats.faults += 1;
                scan_loop.initialize();
            }
        }
        parameters = *scan_loop.parameters();
        // board session closes here
    }

    log.log_message("stopped");
    log.flush();
    tracing::info!(?stats, "scanner stopped");
    stats
}

/// Spawn [`run_scanner`] on a named thread.
pub fn spawn_scanner(ctx: ScannerContext) -> AppResult<JoinHandle<ScannerStats>> {
    thread::Builder::new()
        .name("scanner".to_string())
        .spawn(move || run_scanner(ctx))
        .map_err(|e| DslmError::Worker(format!("failed to spawn scanner: {e}")))
}
