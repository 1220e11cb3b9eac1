//! HTTP/2 flow control
//!
//! Credit accounting for one scope - the connection (stream 0) or a single
//! stream - as defined in RFC 7540 Section 5.2.
//!
//! The local window tracks how many bytes the peer may still send us and is
//! replenished automatically: when it drops below `min_local_size`,
//! [`FlowControlWindow::bytes_received`] returns the WINDOW_UPDATE delta the
//! caller must put on the wire. The remote window tracks how many bytes we
//! may send; it may legally go negative after a SETTINGS-initiated
//! initial-window decrease (RFC 7540 Section 6.9.2), which is why the raw
//! value is signed and the public accessor clamps at zero.

use crate::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Per-scope flow control window pair.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Stream this window belongs to (0 = connection scope), for tracing.
    stream_id: u32,
    local_size: i64,
    local_step: i64,
    min_local_size: i64,
    bytes_received: u64,
    remote_size: i64,
    bytes_sent: u64,
}

impl FlowControlWindow {
    /// Create a window pair for the given scope with the RFC defaults.
    pub fn new(stream_id: u32) -> Self {
        FlowControlWindow {
            stream_id,
            local_size: DEFAULT_WINDOW_SIZE as i64,
            local_step: DEFAULT_WINDOW_SIZE as i64,
            min_local_size: 32768,
            bytes_received: 0,
            remote_size: DEFAULT_WINDOW_SIZE as i64,
            bytes_sent: 0,
        }
    }

    /// Set the initial local window (what we advertise to the peer).
    pub fn init_local_window_size(&mut self, size: u32) {
        self.local_size = size.min(MAX_WINDOW_SIZE) as i64;
    }

    /// Set the initial remote window (what the peer advertised to us).
    pub fn init_remote_window_size(&mut self, size: u32) {
        self.remote_size = size.min(MAX_WINDOW_SIZE) as i64;
    }

    /// Set the replenishment step. The replenish threshold is capped at
    /// half the step.
    pub fn set_local_window_step(&mut self, step: u32) {
        self.local_step = step.min(MAX_WINDOW_SIZE) as i64;
        if self.min_local_size > self.local_step / 2 {
            self.min_local_size = self.local_step / 2;
        }
    }

    /// Set the replenish threshold, capped at half the step.
    pub fn set_min_local_window_size(&mut self, min: u32) {
        self.min_local_size = min as i64;
        if self.min_local_size > self.local_step / 2 {
            self.min_local_size = self.local_step / 2;
        }
    }

    /// Account `n` bytes sent to the peer.
    pub fn bytes_sent(&mut self, n: usize) {
        let n = n as i64;
        self.bytes_sent += n as u64;
        let before = self.remote_size;
        self.remote_size -= n;
        if self.remote_size <= 0 && before > 0 {
            tracing::debug!(
                stream_id = self.stream_id,
                bytes_sent = self.bytes_sent,
                window = self.remote_size,
                "send window exhausted"
            );
        }
    }

    /// Account `n` bytes received from the peer.
    ///
    /// Returns `Some(delta)` when the local window dropped below the
    /// threshold; the caller must send a WINDOW_UPDATE carrying `delta`.
    /// The window is restored here, so the replenished size never exceeds
    /// the step (and therefore never exceeds 2^31-1).
    pub fn bytes_received(&mut self, n: usize) -> Option<u32> {
        self.bytes_received += n as u64;
        self.local_size -= n as i64;
        if self.local_size < self.min_local_size {
            let delta = self.local_step - self.local_size;
            self.local_size += delta;
            return Some(delta as u32);
        }
        None
    }

    /// Apply a WINDOW_UPDATE (or a retroactive SETTINGS delta, which may be
    /// negative) to the remote window.
    pub fn update_remote_window_size(&mut self, delta: i64) {
        self.remote_size += delta;
    }

    /// Local window, clamped at zero for external callers.
    pub fn local_window_size(&self) -> usize {
        if self.local_size > 0 {
            self.local_size as usize
        } else {
            0
        }
    }

    /// Remote window, clamped at zero for external callers.
    pub fn remote_window_size(&self) -> usize {
        if self.remote_size > 0 {
            self.remote_size as usize
        } else {
            0
        }
    }

    /// Raw signed remote window, for overflow validation.
    pub fn remote_window_raw(&self) -> i64 {
        self.remote_size
    }

    /// Total bytes accounted as sent.
    pub fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Total bytes accounted as received.
    pub fn total_bytes_received(&self) -> u64 {
        self.bytes_received
    }
}
