//! Fixed-length circular sample buffers.
//!
//! Scan loops keep one scan period of samples in a [`RollingBuffer`] and read it back in
//! tick-sized slices that may straddle the end of the period. Every index is reduced
//! modulo the buffer length first, so no start position is ever out of bounds.
//!
//! [`FillingRollingBuffer`] additionally remembers which slots have been written since
//! the last reset. The volumetric scan loop records the piezo read-back into one and
//! only uses the recording once [`FillingRollingBuffer::is_complete`] holds.

/// Circular buffer of `f64` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingBuffer {
    buffer: Vec<f64>,
}

impl RollingBuffer {
    /// Zero-filled buffer of `length` samples.
    pub fn new(length: usize) -> Self {
        Self {
            buffer: vec![0.0; length],
        }
    }

    /// Number of samples in one full cycle.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Backing store in logical order starting at index 0.
    pub fn as_slice(&self) -> &[f64] {
        &self.buffer
    }

    /// Mutable backing store.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.buffer
    }

    /// Read `n` samples starting at `start mod len`, wrapping around the end.
    ///
    /// An empty buffer reads as zeros.
    pub fn read(&self, start: usize, n: usize) -> Vec<f64> {
        let len = self.buffer.len();
        if len == 0 {
            return vec![0.0; n];
        }
        let mut out = Vec::with_capacity(n);
        let mut i = start % len;
        while out.len() < n {
            let take = (len - i).min(n - out.len());
            out.extend_from_slice(&self.buffer[i..i + take]);
            i = 0;
        }
        out
    }

    /// Write `data` starting at `start mod len`, wrapping around the end.
    ///
    /// Data longer than the buffer overwrites itself; the last `len` samples win.
    /// Writes into an empty buffer are ignored.
    pub fn write(&mut self, data: &[f64], start: usize) {
        let len = self.buffer.len();
        if len == 0 {
            return;
        }
        let mut i = start % len;
        for &value in data {
            self.buffer[i] = value;
            i += 1;
            if i == len {
                i = 0;
            }
        }
    }

    /// Set `n` samples starting at `start mod len` to `value`.
    pub fn fill(&mut self, start: usize, n: usize, value: f64) {
        let len = self.buffer.len();
        if len == 0 {
            return;
        }
        let i0 = start % len;
        for k in 0..n.min(len) {
            self.buffer[(i0 + k) % len] = value;
        }
    }
}

/// [`RollingBuffer`] that tracks which slots have been written.
#[derive(Debug, Clone, PartialEq)]
pub struct FillingRollingBuffer {
    inner: RollingBuffer,
    filled: Vec<bool>,
    n_filled: usize,
}

impl FillingRollingBuffer {
    /// Empty buffer of `length` samples, nothing filled.
    pub fn new(length: usize) -> Self {
        Self {
            inner: RollingBuffer::new(length),
            filled: vec![false; length],
            n_filled: 0,
        }
    }

    /// Number of samples in one full cycle.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Backing samples.
    pub fn as_slice(&self) -> &[f64] {
        self.inner.as_slice()
    }

    /// See [`RollingBuffer::read`].
    pub fn read(&self, start: usize, n: usize) -> Vec<f64> {
        self.inner.read(start, n)
    }

    /// Write like [`RollingBuffer::write`] and mark the written slots.
    pub fn write(&mut self, data: &[f64], start: usize) {
        self.inner.write(data, start);
        let len = self.filled.len();
        if len == 0 {
            return;
        }
        let i0 = start % len;
        for k in 0..data.len().min(len) {
            let slot = &mut self.filled[(i0 + k) % len];
            if !*slot {
                *slot = true;
                self.n_filled += 1;
            }
        }
    }

    /// True once every slot has been written since creation or the last reset.
    pub fn is_complete(&self) -> bool {
        self.n_filled == self.filled.len()
    }

    /// Forget coverage; sample values are kept.
    pub fn reset(&mut self) {
        self.filled.fill(false);
        self.n_filled = 0;
    }
}
