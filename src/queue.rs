//! Non-blocking queue operations shared by every worker loop.
//!
//! Workers never block indefinitely on a receive: they poll with a short timeout so the
//! stop flag is observed promptly. "Queue empty" is an ordinary return value here.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Drain `rx` without blocking and return the newest value, if any.
///
/// Older values are discarded: settings queues are last-write-wins.
pub fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut latest = None;
    while let Ok(value) = rx.try_recv() {
        latest = Some(value);
    }
    latest
}

/// Wait up to `timeout` for a first value, then drain to the newest.
pub fn recv_latest_timeout<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    match rx.recv_timeout(timeout) {
        Ok(first) => Some(try_recv_latest(rx).unwrap_or(first)),
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
    }
}

/// Receive one value, waiting at most `timeout`.
pub fn recv_timeout<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    rx.recv_timeout(timeout).ok()
}

/// Discard everything currently queued; returns the number of dropped items.
pub fn drain<T>(rx: &Receiver<T>) -> usize {
    rx.try_iter().count()
}

/// Send without blocking. Returns `false` if the value was dropped.
pub fn offer<T>(tx: &Sender<T>, value: T) -> bool {
    match tx.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
    }
}

/// Block until `value` is queued, retrying every `timeout` until `cancelled` returns true.
///
/// Returns `false` if the value was not delivered.
pub fn send_until<T>(
    tx: &Sender<T>,
    value: T,
    timeout: Duration,
    cancelled: impl Fn() -> bool,
) -> bool {
    let mut pending = value;
    loop {
        match tx.send_timeout(pending, timeout) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(v)) => {
                if cancelled() {
                    return false;
                }
                pending = v;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Bounded channel where the producer evicts the oldest value when full.
///
/// Used for display-only streams (piezo waveform, frame rate, saving status) where a
/// consumer only ever wants the most recent value and the producer must never block.
#[derive(Debug)]
pub struct LatestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for LatestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> LatestQueue<T> {
    /// Create a queue holding at most `capacity` values (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Publish `value`, evicting the oldest queued values if needed.
    pub fn publish(&self, mut value: T) {
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(TrySendError::Full(v)) => {
                    let _ = self.rx.try_recv();
                    value = v;
                }
                // Both endpoints live in self
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Newest queued value, draining the queue.
    pub fn latest(&self) -> Option<T> {
        try_recv_latest(&self.rx)
    }

    /// Next queued value in FIFO order.
    pub fn next(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop every queued value.
    pub fn clear(&self) {
        drain(&self.rx);
    }
}
