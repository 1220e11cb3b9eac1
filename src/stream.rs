//! HTTP/2 stream state machine
//!
//! One [`H2Stream`] per logical exchange, owned by the connection's stream
//! table and addressed by id - a stream never holds a reference back to its
//! connection. It applies the RFC 7540 Section 5.1 transition rules, owns
//! the stream-scope flow control window, and reports outcomes as values the
//! connection turns into frames and events.

use crate::error::ErrorCode;
use crate::flow_control::FlowControlWindow;
use crate::frames::FrameType;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Reserved (local): PUSH_PROMISE sent
    ReservedLocal,
    /// Reserved (remote): PUSH_PROMISE received
    ReservedRemote,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed (terminal)
    Closed,
}

impl StreamState {
    /// An "open" state for concurrency accounting (RFC 7540 Section 5.1.2
    /// counts open and half-closed streams against the limit).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Outcome of checking or applying a frame against the stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameVerdict {
    /// Frame is tolerated but has no effect (e.g. WINDOW_UPDATE on a
    /// closed stream).
    Ignore,
    /// Reset this stream with the code; connection unaffected.
    StreamError(ErrorCode),
    /// Fail the whole connection with the code.
    ConnectionError(ErrorCode),
}

/// What a completed header block meant to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeadersKind {
    /// Initial header block (request or response headers).
    Initial,
    /// A second block on an already-open exchange: trailers.
    Trailers,
}

/// Per-stream protocol state.
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow: FlowControlWindow,

    headers_received: bool,
    trailers_received: bool,

    end_stream_sent: bool,
    end_stream_received: bool,
    rst_sent: bool,
    rst_received: bool,

    /// Set when a send was refused for lack of window; cleared by
    /// WINDOW_UPDATE / buffer-drain notification.
    write_blocked: bool,
}

impl H2Stream {
    /// Create a stream with the negotiated initial window sizes.
    pub fn new(id: StreamId, initial_local_window: u32, initial_remote_window: u32) -> Self {
        let mut flow = FlowControlWindow::new(id);
        flow.init_local_window_size(initial_local_window);
        flow.init_remote_window_size(initial_remote_window);
        flow.set_local_window_step(initial_local_window);
        H2Stream {
            id,
            state: StreamState::Idle,
            flow,
            headers_received: false,
            trailers_received: false,
            end_stream_sent: false,
            end_stream_received: false,
            rst_sent: false,
            rst_received: false,
            write_blocked: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow_control(&self) -> &FlowControlWindow {
        &self.flow
    }

    pub fn flow_control_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.flow
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    pub fn set_write_blocked(&mut self, blocked: bool) {
        self.write_blocked = blocked;
    }

    pub fn end_stream_received(&self) -> bool {
        self.end_stream_received
    }

    pub fn end_stream_sent(&self) -> bool {
        self.end_stream_sent
    }

    /// RFC 7540 Section 5.1 per-state frame admission.
    pub(crate) fn verify_frame(&self, frame_type: FrameType) -> Option<FrameVerdict> {
        use FrameType::*;
        match self.state {
            StreamState::Idle => {
                if !matches!(frame_type, Headers | Priority | PushPromise) {
                    // The peer referenced a stream it never opened.
                    return Some(FrameVerdict::ConnectionError(ErrorCode::ProtocolError));
                }
            }
            StreamState::ReservedLocal => {
                if !matches!(frame_type, RstStream | Priority | WindowUpdate) {
                    return Some(FrameVerdict::ConnectionError(ErrorCode::ProtocolError));
                }
            }
            StreamState::ReservedRemote => {
                if !matches!(frame_type, Headers | RstStream | Priority) {
                    return Some(FrameVerdict::ConnectionError(ErrorCode::ProtocolError));
                }
            }
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::HalfClosedRemote => {
                if !matches!(frame_type, RstStream | Priority | WindowUpdate) {
                    return Some(FrameVerdict::StreamError(ErrorCode::StreamClosed));
                }
            }
            StreamState::Closed => {
                if (self.rst_received || self.end_stream_received)
                    && !matches!(frame_type, Priority)
                {
                    return Some(FrameVerdict::StreamError(ErrorCode::StreamClosed));
                }
            }
        }
        None
    }

    // -- Receive path --

    /// Apply a DATA frame. Returns the WINDOW_UPDATE delta to send if the
    /// local window replenished.
    pub(crate) fn recv_data(
        &mut self,
        len: usize,
        end_stream: bool,
    ) -> Result<Option<u32>, FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::Data) {
            return Err(verdict);
        }
        if !matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal) {
            return Err(FrameVerdict::StreamError(ErrorCode::StreamClosed));
        }
        if end_stream {
            tracing::trace!(stream_id = self.id, "END_STREAM received");
            self.note_end_stream_received();
        }
        Ok(self.flow.bytes_received(len))
    }

    /// Apply a completed header block (HEADERS plus any CONTINUATIONs).
    pub(crate) fn recv_headers(
        &mut self,
        end_stream: bool,
    ) -> Result<HeadersKind, FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::Headers) {
            return Err(verdict);
        }
        let kind = if self.headers_received
            && matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
        {
            self.trailers_received = true;
            HeadersKind::Trailers
        } else {
            self.headers_received = true;
            HeadersKind::Initial
        };
        match self.state {
            StreamState::ReservedRemote => self.state = StreamState::HalfClosedLocal,
            StreamState::Idle => self.state = StreamState::Open,
            _ => {}
        }
        if end_stream {
            tracing::trace!(stream_id = self.id, "END_STREAM received");
            self.note_end_stream_received();
        }
        Ok(kind)
    }

    /// Apply a PRIORITY frame.
    pub(crate) fn recv_priority(&mut self, dependency: u32) -> Result<(), FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::Priority) {
            return Err(verdict);
        }
        if dependency == self.id {
            // RFC 7540 Section 5.3.1: self-dependency is a stream error.
            return Err(FrameVerdict::StreamError(ErrorCode::ProtocolError));
        }
        Ok(())
    }

    /// Apply a RST_STREAM frame. Returns the stream to the closed state.
    pub(crate) fn recv_rst(&mut self) -> Result<(), FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::RstStream) {
            return Err(verdict);
        }
        if self.state == StreamState::Closed {
            return Err(FrameVerdict::Ignore);
        }
        self.rst_received = true;
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Apply a PUSH_PROMISE received on this (promised) stream.
    pub(crate) fn recv_push_promise(&mut self) -> Result<(), FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::PushPromise) {
            return Err(verdict);
        }
        self.headers_received = true;
        self.state = StreamState::ReservedRemote;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE. Returns true when the send window went from
    /// exhausted to positive - the caller re-drives blocked writes.
    pub(crate) fn recv_window_update(&mut self, increment: u32) -> Result<bool, FrameVerdict> {
        if let Some(verdict) = self.verify_frame(FrameType::WindowUpdate) {
            return Err(verdict);
        }
        if self.state == StreamState::Closed {
            return Err(FrameVerdict::Ignore);
        }
        if increment == 0 {
            // RFC 7540 Section 6.9.
            return Err(FrameVerdict::StreamError(ErrorCode::ProtocolError));
        }
        if self.flow.remote_window_raw() + i64::from(increment) > crate::MAX_WINDOW_SIZE as i64 {
            return Err(FrameVerdict::StreamError(ErrorCode::FlowControlError));
        }
        let was_exhausted = self.flow.remote_window_size() == 0;
        self.flow.update_remote_window_size(i64::from(increment));
        Ok(was_exhausted && self.state != StreamState::Idle && self.flow.remote_window_size() > 0)
    }

    // -- Send path --

    /// Record locally-sent headers and transition accordingly.
    pub(crate) fn note_headers_sent(&mut self, end_stream: bool) {
        match self.state {
            StreamState::Idle => self.state = StreamState::Open,
            StreamState::ReservedLocal => self.state = StreamState::HalfClosedRemote,
            _ => {}
        }
        if end_stream {
            self.note_end_stream_sent();
        }
    }

    /// Record a locally-sent PUSH_PROMISE for this promised stream.
    pub(crate) fn note_push_promise_sent(&mut self) {
        self.state = StreamState::ReservedLocal;
    }

    /// Record `len` bytes of DATA put on the wire.
    pub(crate) fn note_data_sent(&mut self, len: usize, end_stream: bool) {
        self.flow.bytes_sent(len);
        if end_stream {
            self.note_end_stream_sent();
        }
    }

    /// Whether DATA may be sent at all in the current state.
    pub(crate) fn can_send_data(&self) -> bool {
        !matches!(self.state, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    pub(crate) fn note_rst_sent(&mut self) {
        self.rst_sent = true;
        self.state = StreamState::Closed;
    }

    fn note_end_stream_sent(&mut self) {
        self.end_stream_sent = true;
        if self.state == StreamState::HalfClosedRemote {
            self.state = StreamState::Closed;
        } else {
            self.state = StreamState::HalfClosedLocal;
        }
    }

    fn note_end_stream_received(&mut self) {
        self.end_stream_received = true;
        if self.state == StreamState::HalfClosedLocal {
            self.state = StreamState::Closed;
        } else {
            self.state = StreamState::HalfClosedRemote;
        }
    }
}

/// Server-initiated (push) streams carry even ids; client streams odd.
pub fn is_promised_stream(stream_id: StreamId) -> bool {
    stream_id % 2 == 0
}
