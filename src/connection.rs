//! HTTP/2 connection engine
//!
//! [`H2Connection`] owns the frame assembler, both HPACK directions, the
//! connection-scope flow control window and the stream table, and drives
//! the preface/upgrade/SETTINGS handshake. It is sans-IO: the transport
//! feeds bytes in via [`H2Connection::deliver`], drains outgoing bytes via
//! [`H2Connection::take_pending_send`], and reports flushes via
//! [`H2Connection::notify_writable`]; the application drains decoded
//! results from the [`H2Event`] queue.
//!
//! All state mutation happens on the caller's single logical thread; the
//! engine contains no locking.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bytes::Bytes;

use crate::assembler::{Assembled, FrameAssembler};
use crate::codec::FrameCodec;
use crate::error::{Error, ErrorCode, Result};
use crate::flow_control::FlowControlWindow;
use crate::frames::{
    ContinuationFrame, DataFrame, Frame, GoawayFrame, HeadersFrame, PingFrame, PriorityFrame,
    PushPromiseFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
};
use crate::hpack::{Decoder, Encoder, Header, HeaderList, IndexingPolicy};
use crate::settings::{Settings, SettingsBuilder};
use crate::stream::{is_promised_stream, FrameVerdict, H2Stream, HeadersKind, StreamId, StreamState};
use crate::upgrade::{self, UpgradeRole, UpgradeScanner};
use crate::{CONNECTION_PREFACE, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Default local connection-scope window (advertised via WINDOW_UPDATE
/// after the preface).
pub const LOCAL_CONN_INITIAL_WINDOW_SIZE: u32 = 20 * 1024 * 1024;

/// Default local per-stream window (advertised via SETTINGS).
pub const LOCAL_STREAM_INITIAL_WINDOW_SIZE: u32 = 6 * 1024 * 1024;

/// Default max frame size we advertise.
const LOCAL_MAX_FRAME_SIZE: u32 = 65536;

/// Default cap on peer-initiated concurrent streams (server side).
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 128;

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Idle,
    Connecting,
    Upgrading,
    Handshake,
    Open,
    Error,
    Closed,
}

/// Events produced by the engine for the application.
#[derive(Debug)]
pub enum H2Event {
    /// Handshake finished; requests may flow.
    Connected,
    /// A complete header block arrived on a stream.
    Headers {
        stream_id: StreamId,
        headers: HeaderList,
        end_stream: bool,
    },
    /// Trailing headers arrived on a stream.
    Trailers {
        stream_id: StreamId,
        headers: HeaderList,
        end_stream: bool,
    },
    /// Body bytes arrived on a stream.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// The peer promised a pushed stream.
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderList,
    },
    /// A stream ended abnormally (RST_STREAM in either direction, or
    /// connection teardown).
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// A previously blocked stream may retry its write.
    StreamWritable { stream_id: StreamId },
    /// The peer acknowledged our SETTINGS.
    SettingsAcknowledged,
    /// The peer is shutting the connection down.
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    /// The connection failed; all streams have been reset.
    ConnectionError { error_code: ErrorCode },
}

/// Engine tuning knobs.
pub struct EngineConfig {
    /// Settings advertised to the peer in our SETTINGS frame.
    pub settings: Settings,
    /// Local connection-scope window target.
    pub conn_window: u32,
    /// HPACK incremental-indexing policy for the encode direction.
    pub indexing_policy: IndexingPolicy,
    /// Cap on peer-initiated concurrent streams.
    pub max_concurrent_streams: u32,
}

impl EngineConfig {
    /// The default tuning for a role: large local windows, 64KB frames,
    /// and (server side) a 128-stream concurrency cap.
    pub fn default_for(role: Role) -> Self {
        let mut builder = SettingsBuilder::new()
            .initial_window_size(LOCAL_STREAM_INITIAL_WINDOW_SIZE)
            .max_frame_size(LOCAL_MAX_FRAME_SIZE);
        if role == Role::Server {
            builder = builder.max_concurrent_streams(DEFAULT_MAX_CONCURRENT_STREAMS);
        }
        EngineConfig {
            settings: builder.build().expect("default settings are valid"),
            conn_window: LOCAL_CONN_INITIAL_WINDOW_SIZE,
            indexing_policy: IndexingPolicy::default(),
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

/// Pending CONTINUATION bookkeeping: which stream owns the unfinished
/// header block, and what the initiating frame carried.
struct ContinuationContext {
    stream_id: StreamId,
    end_stream: bool,
    /// Set when the block was started by PUSH_PROMISE: the promised id.
    promised_stream_id: Option<StreamId>,
}

/// Admission hook for server-side stream creation.
pub type AcceptHook = Box<dyn FnMut(StreamId) -> bool + Send>;

/// Client/server HTTP/2 connection engine.
pub struct H2Connection {
    role: Role,
    state: ConnState,

    local_settings: Settings,
    remote_settings: Settings,
    conn_window: u32,
    max_concurrent_streams: u32,

    assembler: FrameAssembler,
    encoder: Encoder,
    decoder: Decoder,
    flow: FlowControlWindow,

    streams: HashMap<StreamId, H2Stream>,
    promised_streams: HashMap<StreamId, H2Stream>,
    blocked_streams: BTreeSet<StreamId>,

    next_stream_id: StreamId,
    last_stream_id: StreamId,
    /// Highest peer-promised (even) stream id seen on the client side.
    last_promised_id: StreamId,

    /// Largest frame payload the peer accepts from us.
    max_remote_frame_size: u32,
    /// Peer's INITIAL_WINDOW_SIZE, applied to new and open streams.
    init_remote_window: u32,
    /// Our advertised per-stream window.
    init_local_window: u32,

    expect_continuation: Option<ContinuationContext>,
    header_block_buf: Vec<u8>,

    /// Server side: how much of the client preface is still unmatched.
    preface_offset: usize,
    /// Peer's SETTINGS frame has arrived.
    preface_received: bool,
    /// The very first frame after the preface must be SETTINGS.
    first_frame_seen: bool,

    upgrade_scanner: Option<UpgradeScanner>,

    send_buf: Vec<u8>,
    events: VecDeque<H2Event>,
    accept_hook: Option<AcceptHook>,
}

impl H2Connection {
    /// Create a client-side engine. Call [`connect`](Self::connect) and
    /// then one of the `handle_connected*` entry points as the transport
    /// comes up.
    pub fn client() -> Self {
        Self::with_config(Role::Client, EngineConfig::default_for(Role::Client))
    }

    /// Create a server-side engine. Call [`attach`](Self::attach) (ALPN)
    /// or [`attach_h2c`](Self::attach_h2c) (upgrade) once the transport is
    /// accepted.
    pub fn server() -> Self {
        Self::with_config(Role::Server, EngineConfig::default_for(Role::Server))
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(role: Role, config: EngineConfig) -> Self {
        let local_settings = config.settings;
        let init_local_window = local_settings.get_initial_window_size();
        let mut flow = FlowControlWindow::new(0);
        flow.init_local_window_size(config.conn_window);
        flow.set_local_window_step(config.conn_window);
        flow.set_min_local_window_size(init_local_window);

        let max_local_frame_size = local_settings.get_max_frame_size();

        H2Connection {
            role,
            state: ConnState::Idle,
            local_settings,
            remote_settings: Settings::default_settings(),
            conn_window: config.conn_window,
            max_concurrent_streams: config.max_concurrent_streams,
            assembler: FrameAssembler::new(max_local_frame_size),
            encoder: Encoder::with_policy(config.indexing_policy),
            decoder: Decoder::new(),
            flow,
            streams: HashMap::new(),
            promised_streams: HashMap::new(),
            blocked_streams: BTreeSet::new(),
            next_stream_id: if role == Role::Client { 1 } else { 2 },
            last_stream_id: 0,
            last_promised_id: 0,
            max_remote_frame_size: 16384,
            init_remote_window: DEFAULT_WINDOW_SIZE,
            init_local_window,
            expect_continuation: None,
            header_block_buf: Vec::new(),
            preface_offset: if role == Role::Server {
                CONNECTION_PREFACE.len()
            } else {
                0
            },
            preface_received: false,
            first_frame_seen: false,
            upgrade_scanner: None,
            send_buf: Vec::new(),
            events: VecDeque::new(),
            accept_hook: None,
        }
    }

    // -- Lifecycle entry points --

    /// Client: the transport dial has started.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnState::Idle {
            return Err(Error::NotReady);
        }
        self.state = ConnState::Connecting;
        Ok(())
    }

    /// Client: the transport is up with HTTP/2 already negotiated (ALPN or
    /// prior knowledge). Queues the connection preface.
    pub fn handle_connected(&mut self) -> Result<()> {
        if self.state != ConnState::Connecting && self.state != ConnState::Idle {
            return Err(Error::NotReady);
        }
        self.send_preface();
        Ok(())
    }

    /// Client: the transport is up on cleartext; negotiate via HTTP/1.1
    /// Upgrade first. Stream id 1 is reserved for the upgrade request.
    pub fn handle_connected_h2c(&mut self, host: &str) -> Result<()> {
        if self.state != ConnState::Connecting && self.state != ConnState::Idle {
            return Err(Error::NotReady);
        }
        let request = upgrade::build_upgrade_request(host, &self.local_settings);
        self.send_buf.extend_from_slice(request.as_bytes());
        self.next_stream_id += 2;
        self.upgrade_scanner = Some(UpgradeScanner::new(UpgradeRole::Response));
        self.state = ConnState::Upgrading;
        Ok(())
    }

    /// Server: a transport with HTTP/2 negotiated was accepted. Queues our
    /// SETTINGS preface and waits for the client preface bytes.
    pub fn attach(&mut self) -> Result<()> {
        if self.state != ConnState::Idle {
            return Err(Error::NotReady);
        }
        self.send_preface();
        Ok(())
    }

    /// Server: a cleartext transport was accepted; wait for the HTTP/1.1
    /// upgrade request.
    pub fn attach_h2c(&mut self) -> Result<()> {
        if self.state != ConnState::Idle {
            return Err(Error::NotReady);
        }
        self.upgrade_scanner = Some(UpgradeScanner::new(UpgradeRole::Request));
        self.state = ConnState::Upgrading;
        Ok(())
    }

    /// Install the server-side stream admission hook.
    pub fn set_accept_hook(&mut self, hook: AcceptHook) {
        self.accept_hook = Some(hook);
    }

    // -- Transport boundary --

    /// Feed bytes received from the transport.
    pub fn deliver(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConnState::Open | ConnState::Handshake => self.handle_input(data),
            ConnState::Upgrading => self.handle_upgrade_input(data),
            _ => Err(Error::NotReady),
        }
        .inspect_err(|err| {
            if self.state != ConnState::Error && self.state != ConnState::Closed {
                self.connection_error(err.error_code());
            }
        })
    }

    /// Take all bytes pending for the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.send_buf);
        self.maybe_open();
        out
    }

    /// Whether bytes are waiting for the transport.
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// The transport flushed everything it took; retry blocked work.
    pub fn notify_writable(&mut self) {
        self.maybe_open();
        if self.state == ConnState::Open {
            self.notify_blocked_streams();
        }
    }

    /// Whether the engine still expects transport bytes.
    pub fn wants_more_bytes(&self) -> bool {
        self.state != ConnState::Error && self.state != ConnState::Closed
    }

    /// Poll the next application event.
    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    // -- Accessors --

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Open and ready for requests.
    pub fn is_ready(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Connection-scope send window as seen by flow control.
    pub fn remote_window_size(&self) -> usize {
        self.flow.remote_window_size()
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// State of a live stream, if present in the table.
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.get_stream(stream_id).map(|s| s.state())
    }

    fn active_stream_count(&self) -> usize {
        self.streams
            .values()
            .chain(self.promised_streams.values())
            .filter(|s| s.state().is_active())
            .count()
    }

    // -- Stream API --

    /// Allocate the next locally-initiated stream.
    pub fn open_stream(&mut self) -> Result<StreamId> {
        if self.state == ConnState::Error || self.state == ConnState::Closed {
            return Err(Error::ConnectionClosed);
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        let stream = H2Stream::new(stream_id, self.init_local_window, self.init_remote_window);
        self.insert_stream(stream);
        Ok(stream_id)
    }

    /// Encode and send a header block on a stream. HEADERS frames are never
    /// deferred: compression state must stay synchronized with encode order.
    pub fn send_headers(
        &mut self,
        stream_id: StreamId,
        headers: &[Header],
        end_stream: bool,
    ) -> Result<()> {
        if !validate_pseudo_header_order(headers) {
            return Err(Error::InvalidHeader(
                "pseudo-headers must precede regular headers".to_string(),
            ));
        }
        if self.get_stream(stream_id).is_none() {
            return Err(Error::StreamNotFound(stream_id));
        }

        let mut block = Vec::new();
        self.encoder.encode(headers, &mut block);
        let frame = HeadersFrame::new(stream_id, Bytes::from(block), end_stream, true);
        tracing::debug!(stream_id, end_stream, "sending HEADERS");
        let encoded = FrameCodec::encode_headers_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);

        let stream = self.get_stream_mut(stream_id).expect("checked above");
        stream.note_headers_sent(end_stream);
        self.reap_if_closed(stream_id);
        Ok(())
    }

    /// Send body bytes on a stream, honoring both flow control windows and
    /// the outbound-buffer gate.
    ///
    /// Returns the number of bytes accepted: `0` means the stream is
    /// blocked and has registered for a [`H2Event::StreamWritable`] retry;
    /// a short count means the remainder must be resubmitted after that
    /// event. Nothing is ever buffered on the caller's behalf.
    pub fn send_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize> {
        if self.state != ConnState::Open {
            return Err(Error::NotReady);
        }
        let conn_window = self.flow.remote_window_size();
        let stream = self
            .get_stream_mut(stream_id)
            .ok_or(Error::StreamNotFound(stream_id))?;
        if !stream.can_send_data() {
            return Err(Error::StreamClosed(stream_id));
        }
        if stream.is_write_blocked() {
            return Ok(0);
        }

        // DATA behind a non-empty outbound buffer is deferred to preserve
        // per-stream ordering; a final END_STREAM frame may jump the queue.
        if !self.send_buf.is_empty() && !end_stream {
            let stream = self.get_stream_mut(stream_id).expect("checked above");
            stream.set_write_blocked(true);
            self.blocked_streams.insert(stream_id);
            return Ok(0);
        }

        let stream = self.get_stream_mut(stream_id).expect("checked above");
        let stream_window = stream.flow_control().remote_window_size();
        let window = stream_window.min(conn_window);

        if window == 0 && !(end_stream && data.is_empty()) {
            stream.set_write_blocked(true);
            self.blocked_streams.insert(stream_id);
            tracing::debug!(
                stream_id,
                stream_window,
                conn_window,
                "send blocked on flow control"
            );
            return Ok(0);
        }

        let slen = window.min(data.len()).min(self.max_remote_frame_size as usize);
        let complete = slen == data.len();
        let frame = DataFrame::new(
            stream_id,
            Bytes::copy_from_slice(&data[..slen]),
            end_stream && complete,
        );
        let encoded = FrameCodec::encode_data_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);

        self.flow.bytes_sent(slen);
        let stream = self.get_stream_mut(stream_id).expect("checked above");
        stream.note_data_sent(slen, end_stream && complete);
        if !complete {
            stream.set_write_blocked(true);
            self.blocked_streams.insert(stream_id);
        }
        self.reap_if_closed(stream_id);
        Ok(slen)
    }

    /// Server: promise a pushed stream associated with `stream_id`.
    /// Returns the promised (even) stream id.
    pub fn promise_stream(
        &mut self,
        stream_id: StreamId,
        headers: &[Header],
    ) -> Result<StreamId> {
        if self.role != Role::Server {
            return Err(Error::Protocol("only servers push".to_string()));
        }
        if !self.remote_settings.get_enable_push() {
            return Err(Error::Protocol("peer disabled push".to_string()));
        }
        match self.get_stream(stream_id).map(|s| s.state()) {
            Some(state) if state.is_active() => {}
            _ => return Err(Error::InvalidStreamId(stream_id)),
        }

        let promised_stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut block = Vec::new();
        self.encoder.encode(headers, &mut block);
        let frame = PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block: Bytes::from(block),
            end_headers: true,
            padding: None,
        };
        let encoded = FrameCodec::encode_push_promise_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);

        let mut stream =
            H2Stream::new(promised_stream_id, self.init_local_window, self.init_remote_window);
        stream.note_push_promise_sent();
        self.insert_stream(stream);
        Ok(promised_stream_id)
    }

    /// Reset a stream with the given code.
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.send_rst_stream(stream_id, error_code);
        self.remove_stream(stream_id);
    }

    /// Cancel and forget a stream.
    pub fn close_stream(&mut self, stream_id: StreamId) {
        let Some(state) = self.stream_state(stream_id) else {
            return;
        };
        if state != StreamState::Closed && state != StreamState::Idle {
            self.send_rst_stream(stream_id, ErrorCode::Cancel);
        }
        self.remove_stream(stream_id);
    }

    /// Send a PING.
    pub fn send_ping(&mut self, data: [u8; 8]) {
        let encoded = FrameCodec::encode_ping_frame(&PingFrame::new(data));
        self.send_buf.extend_from_slice(&encoded);
    }

    /// Gracefully close: GOAWAY(NO_ERROR), fail live streams, stop.
    pub fn close(&mut self) {
        tracing::debug!("closing connection");
        if self.state <= ConnState::Open {
            self.send_goaway(ErrorCode::NoError);
        }
        self.fail_all_streams(ErrorCode::NoError);
        self.state = ConnState::Closed;
    }

    // -- Preface / upgrade --

    fn send_preface(&mut self) {
        self.state = ConnState::Handshake;
        if self.role == Role::Client {
            self.send_buf.extend_from_slice(CONNECTION_PREFACE);
        }

        let frame = SettingsFrame::new(self.local_settings.clone());
        let encoded = FrameCodec::encode_settings_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);

        // Raise the connection window to the configured size.
        if self.conn_window > DEFAULT_WINDOW_SIZE {
            let delta = self.conn_window - DEFAULT_WINDOW_SIZE;
            let wu = WindowUpdateFrame::new(0, delta);
            let encoded = FrameCodec::encode_window_update_frame(&wu);
            self.send_buf.extend_from_slice(&encoded);
        }
        tracing::debug!(role = ?self.role, "preface queued");
    }

    fn handle_upgrade_input(&mut self, data: &[u8]) -> Result<()> {
        let scanner = self
            .upgrade_scanner
            .as_mut()
            .expect("upgrading without scanner");
        let Some(outcome) = scanner.feed(data)? else {
            return Ok(());
        };
        self.upgrade_scanner = None;
        let residual = &data[outcome.consumed..];

        match self.role {
            Role::Client => {
                // 101 received: start the HTTP/2 handshake proper.
                tracing::debug!("h2c upgrade accepted");
                self.send_preface();
            }
            Role::Server => {
                // Apply the client's HTTP2-Settings payload, answer 101 and
                // queue our preface behind it.
                if let Some(payload) = outcome.settings_payload {
                    let settings = Settings::decode(&payload)?;
                    self.apply_remote_settings(&settings)?;
                }
                let response = upgrade::build_upgrade_response();
                self.send_buf.extend_from_slice(response.as_bytes());
                self.send_preface();
            }
        }

        if residual.is_empty() {
            Ok(())
        } else {
            // Residual bytes are the start of the peer's preface.
            self.handle_input(residual)
        }
    }

    fn handle_input(&mut self, mut data: &[u8]) -> Result<()> {
        // Server side: match the client preface incrementally.
        if self.preface_offset > 0 {
            let start = CONNECTION_PREFACE.len() - self.preface_offset;
            let cmp = self.preface_offset.min(data.len());
            if data[..cmp] != CONNECTION_PREFACE[start..start + cmp] {
                tracing::warn!("invalid connection preface");
                return Err(Error::MissingPreface);
            }
            self.preface_offset -= cmp;
            if self.preface_offset > 0 {
                return Ok(()); // need more preface bytes
            }
            data = &data[cmp..];
        }

        let mut assembled = Vec::new();
        self.assembler.feed(data, &mut assembled)?;
        for item in assembled {
            if self.state == ConnState::Closed || self.state == ConnState::Error {
                break;
            }
            match item {
                Assembled::Frame(frame) => self.handle_frame(frame)?,
                Assembled::StreamError { header, code } => {
                    self.stream_error(header.stream_id, code);
                }
            }
        }
        Ok(())
    }

    // -- Frame dispatch --

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        // RFC 7540 Section 3.5: the first frame after the preface must be
        // SETTINGS.
        if !self.first_frame_seen {
            if !matches!(frame, Frame::Settings(_)) {
                tracing::warn!("first frame is not SETTINGS");
                return Err(Error::Protocol(
                    "first frame must be SETTINGS".to_string(),
                ));
            }
            self.first_frame_seen = true;
        }

        // CONTINUATION enforcement: nothing may interleave with an
        // unfinished header block.
        if let Some(ctx) = &self.expect_continuation {
            let ok = matches!(&frame, Frame::Continuation(f) if f.stream_id == ctx.stream_id);
            if !ok {
                return Err(Error::Protocol(
                    "expected CONTINUATION for unfinished header block".to_string(),
                ));
            }
        }

        match frame {
            Frame::Data(f) => self.handle_data(f),
            Frame::Headers(f) => self.handle_headers(f),
            Frame::Priority(f) => self.handle_priority(f),
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::Settings(f) => self.handle_settings(f),
            Frame::PushPromise(f) => self.handle_push_promise(f),
            Frame::Ping(f) => self.handle_ping(f),
            Frame::Goaway(f) => self.handle_goaway(f),
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::Continuation(f) => self.handle_continuation(f),
            Frame::Unknown { frame_type, .. } => {
                // Unknown frame types must be ignored (RFC 7540 Section 4.1).
                tracing::trace!(frame_type, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn handle_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            self.events.push_back(H2Event::SettingsAcknowledged);
            return Ok(());
        }

        self.apply_remote_settings(&frame.settings)?;

        // Acknowledge.
        let encoded = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
        self.send_buf.extend_from_slice(&encoded);

        if self.state < ConnState::Open {
            self.preface_received = true;
            self.maybe_open();
        }
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: &Settings) -> Result<()> {
        settings.validate()?;

        if let Some(size) = settings.header_table_size {
            // Bounds the table the peer's encoder may use against us, and
            // the one our encoder may use toward them.
            self.decoder.set_max_table_size(size as usize);
            self.encoder.set_max_table_size(size as usize);
        }
        if let Some(size) = settings.initial_window_size {
            self.update_initial_window_size(size);
        }
        if let Some(size) = settings.max_frame_size {
            self.max_remote_frame_size = size;
        }
        self.remote_settings.merge(settings);
        Ok(())
    }

    /// RFC 7540 Section 6.9.2: an INITIAL_WINDOW_SIZE change applies
    /// retroactively to every open stream's send window.
    fn update_initial_window_size(&mut self, new_size: u32) {
        if new_size == self.init_remote_window {
            return;
        }
        let delta = new_size as i64 - self.init_remote_window as i64;
        self.init_remote_window = new_size;
        for stream in self
            .streams
            .values_mut()
            .chain(self.promised_streams.values_mut())
        {
            stream.flow_control_mut().update_remote_window_size(delta);
        }
    }

    fn handle_data(&mut self, frame: DataFrame) -> Result<()> {
        let len = frame.data.len();

        // Connection-scope accounting happens before stream lookup: bytes
        // for missing streams still consumed the connection window.
        if let Some(delta) = self.flow.bytes_received(len) {
            self.queue_window_update(0, delta);
        }

        let stream_id = frame.stream_id;
        if self.get_stream(stream_id).is_none() {
            let verdict = self.classify_missing_stream(stream_id);
            return self.apply_verdict(stream_id, verdict);
        }

        let stream = self.get_stream_mut(stream_id).expect("checked above");
        match stream.recv_data(len, frame.end_stream) {
            Ok(update) => {
                if let Some(delta) = update {
                    self.queue_window_update(stream_id, delta);
                }
                self.events.push_back(H2Event::Data {
                    stream_id,
                    data: frame.data,
                    end_stream: frame.end_stream,
                });
                self.reap_if_closed(stream_id);
                Ok(())
            }
            Err(verdict) => self.apply_verdict(stream_id, verdict),
        }
    }

    fn handle_headers(&mut self, frame: HeadersFrame) -> Result<()> {
        tracing::debug!(
            stream_id = frame.stream_id,
            end_stream = frame.end_stream,
            end_headers = frame.end_headers,
            "HEADERS received"
        );
        let stream_id = frame.stream_id;

        if self.get_stream(stream_id).is_none() {
            match self.role {
                Role::Server => {
                    if let Some(verdict) = self.admit_new_stream(stream_id) {
                        return self.apply_verdict(stream_id, verdict);
                    }
                }
                Role::Client => {
                    let verdict = self.classify_missing_stream(stream_id);
                    return self.apply_verdict(stream_id, verdict);
                }
            }
        }

        if frame.end_headers {
            self.dispatch_header_block(stream_id, &frame.header_block, frame.end_stream)
        } else {
            self.header_block_buf.extend_from_slice(&frame.header_block);
            self.expect_continuation = Some(ContinuationContext {
                stream_id,
                end_stream: frame.end_stream,
                promised_stream_id: None,
            });
            Ok(())
        }
    }

    /// Lazily create a peer-initiated stream on the server side, applying
    /// the concurrency cap and the admission hook.
    fn admit_new_stream(&mut self, stream_id: StreamId) -> Option<FrameVerdict> {
        if is_promised_stream(stream_id) {
            // Clients initiate odd streams only.
            return Some(FrameVerdict::ConnectionError(ErrorCode::ProtocolError));
        }
        if stream_id <= self.last_stream_id {
            // Reuse of an old id (RFC 7540 Section 5.1.1).
            return Some(FrameVerdict::ConnectionError(ErrorCode::ProtocolError));
        }
        if self.active_stream_count() + 1 > self.max_concurrent_streams as usize {
            tracing::warn!(
                stream_id,
                max = self.max_concurrent_streams,
                "too many concurrent streams"
            );
            return Some(FrameVerdict::StreamError(ErrorCode::RefusedStream));
        }
        if let Some(hook) = self.accept_hook.as_mut() {
            if !hook(stream_id) {
                tracing::debug!(stream_id, "stream refused by admission hook");
                return Some(FrameVerdict::StreamError(ErrorCode::RefusedStream));
            }
        }
        let stream = H2Stream::new(stream_id, self.init_local_window, self.init_remote_window);
        self.insert_stream(stream);
        self.last_stream_id = stream_id;
        None
    }

    /// Decode a complete header block and hand it to the stream.
    fn dispatch_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        let headers = self
            .decoder
            .decode(block)
            // HPACK state is connection-wide; decode failure cannot be
            // recovered locally (RFC 7540 Section 4.3).
            .map_err(|_| Error::Connection(ErrorCode::CompressionError))?;

        if !validate_pseudo_header_order(&headers) {
            self.stream_error(stream_id, ErrorCode::ProtocolError);
            return Ok(());
        }

        let Some(stream) = self.get_stream_mut(stream_id) else {
            return Ok(()); // refused or reset in the meantime
        };
        match stream.recv_headers(end_stream) {
            Ok(HeadersKind::Initial) => {
                self.events.push_back(H2Event::Headers {
                    stream_id,
                    headers,
                    end_stream,
                });
                self.reap_if_closed(stream_id);
                Ok(())
            }
            Ok(HeadersKind::Trailers) => {
                self.events.push_back(H2Event::Trailers {
                    stream_id,
                    headers,
                    end_stream,
                });
                self.reap_if_closed(stream_id);
                Ok(())
            }
            Err(verdict) => self.apply_verdict(stream_id, verdict),
        }
    }

    fn handle_priority(&mut self, frame: PriorityFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        let Some(stream) = self.get_stream_mut(stream_id) else {
            // PRIORITY is valid in every state including idle and closed.
            return Ok(());
        };
        match stream.recv_priority(frame.priority.stream_dependency) {
            Ok(()) => Ok(()),
            Err(verdict) => self.apply_verdict(stream_id, verdict),
        }
    }

    fn handle_rst_stream(&mut self, frame: RstStreamFrame) -> Result<()> {
        tracing::debug!(
            stream_id = frame.stream_id,
            code = %frame.error_code,
            "RST_STREAM received"
        );
        let stream_id = frame.stream_id;
        let Some(stream) = self.get_stream_mut(stream_id) else {
            return Ok(());
        };
        match stream.recv_rst() {
            Ok(()) => {
                self.events.push_back(H2Event::StreamReset {
                    stream_id,
                    error_code: frame.error_code,
                });
                self.remove_stream(stream_id);
                Ok(())
            }
            Err(verdict) => self.apply_verdict(stream_id, verdict),
        }
    }

    fn handle_push_promise(&mut self, frame: PushPromiseFrame) -> Result<()> {
        if self.role == Role::Server {
            return Err(Error::Protocol("client attempted push".to_string()));
        }
        if !self.local_settings.get_enable_push() {
            return Err(Error::Protocol(
                "PUSH_PROMISE received but push is disabled".to_string(),
            ));
        }
        if !is_promised_stream(frame.promised_stream_id)
            || frame.promised_stream_id <= self.last_promised_id
        {
            return Err(Error::Protocol("invalid promised stream id".to_string()));
        }
        match self.get_stream(frame.stream_id).map(|s| s.state()) {
            Some(StreamState::Open) | Some(StreamState::HalfClosedLocal) => {}
            _ => {
                return Err(Error::Protocol(
                    "PUSH_PROMISE on inactive stream".to_string(),
                ));
            }
        }

        if frame.end_headers {
            self.accept_push_promise(
                frame.stream_id,
                frame.promised_stream_id,
                &frame.header_block,
            )
        } else {
            self.header_block_buf.extend_from_slice(&frame.header_block);
            self.expect_continuation = Some(ContinuationContext {
                stream_id: frame.stream_id,
                end_stream: false,
                promised_stream_id: Some(frame.promised_stream_id),
            });
            Ok(())
        }
    }

    fn accept_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        block: &[u8],
    ) -> Result<()> {
        let headers = self
            .decoder
            .decode(block)
            .map_err(|_| Error::Connection(ErrorCode::CompressionError))?;

        let mut stream =
            H2Stream::new(promised_stream_id, self.init_local_window, self.init_remote_window);
        match stream.recv_push_promise() {
            Ok(()) => {
                self.last_promised_id = promised_stream_id;
                self.insert_stream(stream);
                self.events.push_back(H2Event::PushPromise {
                    stream_id,
                    promised_stream_id,
                    headers,
                });
                Ok(())
            }
            Err(verdict) => self.apply_verdict(promised_stream_id, verdict),
        }
    }

    fn handle_ping(&mut self, frame: PingFrame) -> Result<()> {
        if !frame.ack {
            let pong = PingFrame::ack(frame.data);
            let encoded = FrameCodec::encode_ping_frame(&pong);
            self.send_buf.extend_from_slice(&encoded);
        }
        Ok(())
    }

    fn handle_goaway(&mut self, frame: GoawayFrame) -> Result<()> {
        tracing::debug!(
            last_stream_id = frame.last_stream_id,
            code = %frame.error_code,
            "GOAWAY received"
        );
        // Fail every live and promised stream with the carried code, then
        // stop. The owner observes the GoAway event and drops this engine
        // from any registry it lives in.
        self.fail_all_streams(frame.error_code);
        self.events.push_back(H2Event::GoAway {
            last_stream_id: frame.last_stream_id,
            error_code: frame.error_code,
            debug_data: frame.debug_data,
        });
        self.state = ConnState::Closed;
        Ok(())
    }

    fn handle_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        let increment = frame.size_increment;

        if stream_id == 0 {
            if increment == 0 {
                return Err(Error::Protocol(
                    "WINDOW_UPDATE with zero increment".to_string(),
                ));
            }
            if self.flow.remote_window_raw() + i64::from(increment) > MAX_WINDOW_SIZE as i64 {
                return Err(Error::Connection(ErrorCode::FlowControlError));
            }
            let had_blocked = !self.blocked_streams.is_empty();
            self.flow.update_remote_window_size(i64::from(increment));
            tracing::trace!(
                increment,
                window = self.flow.remote_window_size(),
                "connection window update"
            );
            if had_blocked && self.flow.remote_window_size() > 0 {
                self.notify_blocked_streams();
            }
            return Ok(());
        }

        if self.get_stream(stream_id).is_none() {
            if self.role == Role::Server {
                // A WINDOW_UPDATE may be the first frame of a new stream.
                if let Some(verdict) = self.admit_new_stream(stream_id) {
                    return self.apply_verdict(stream_id, verdict);
                }
            } else {
                let verdict = self.classify_missing_stream(stream_id);
                return self.apply_verdict(stream_id, verdict);
            }
        }

        let stream = self.get_stream_mut(stream_id).expect("present");
        match stream.recv_window_update(increment) {
            Ok(became_writable) => {
                if became_writable {
                    let stream = self.get_stream_mut(stream_id).expect("present");
                    stream.set_write_blocked(false);
                    self.blocked_streams.remove(&stream_id);
                    self.events.push_back(H2Event::StreamWritable { stream_id });
                }
                Ok(())
            }
            Err(verdict) => self.apply_verdict(stream_id, verdict),
        }
    }

    fn handle_continuation(&mut self, frame: ContinuationFrame) -> Result<()> {
        let Some(ctx) = &self.expect_continuation else {
            return Err(Error::Protocol("unexpected CONTINUATION".to_string()));
        };
        debug_assert_eq!(ctx.stream_id, frame.stream_id);

        self.header_block_buf.extend_from_slice(&frame.header_block);
        if !frame.end_headers {
            return Ok(());
        }

        let ctx = self.expect_continuation.take().expect("checked above");
        let block = std::mem::take(&mut self.header_block_buf);
        match ctx.promised_stream_id {
            Some(promised) => self.accept_push_promise(ctx.stream_id, promised, &block),
            None => self.dispatch_header_block(ctx.stream_id, &block, ctx.end_stream),
        }
    }

    // -- Error paths --

    /// Fail the connection: GOAWAY with the code, fail every stream, report
    /// once.
    fn connection_error(&mut self, error_code: ErrorCode) {
        tracing::warn!(code = %error_code, "connection error");
        self.send_goaway(error_code);
        self.fail_all_streams(error_code);
        self.state = ConnState::Error;
        self.events.push_back(H2Event::ConnectionError { error_code });
    }

    /// Reset one stream; the connection and all other streams continue.
    fn stream_error(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        tracing::debug!(stream_id, code = %error_code, "stream error");
        self.send_rst_stream(stream_id, error_code);
        if self.get_stream(stream_id).is_some() {
            self.events.push_back(H2Event::StreamReset {
                stream_id,
                error_code,
            });
            self.remove_stream(stream_id);
        }
    }

    fn apply_verdict(&mut self, stream_id: StreamId, verdict: FrameVerdict) -> Result<()> {
        match verdict {
            FrameVerdict::Ignore => Ok(()),
            FrameVerdict::StreamError(code) => {
                self.stream_error(stream_id, code);
                Ok(())
            }
            FrameVerdict::ConnectionError(code) => Err(Error::Connection(code)),
        }
    }

    /// A frame referenced a stream missing from the table: decide between
    /// "stream once existed, now closed" (stream error) and "stream was
    /// never opened" (connection error, RFC 7540 Section 5.1 idle rules).
    fn classify_missing_stream(&self, stream_id: StreamId) -> FrameVerdict {
        let was_created = if is_promised_stream(stream_id) {
            match self.role {
                Role::Client => stream_id <= self.last_promised_id,
                Role::Server => stream_id < self.next_stream_id,
            }
        } else {
            match self.role {
                Role::Client => stream_id < self.next_stream_id,
                Role::Server => stream_id <= self.last_stream_id,
            }
        };
        if was_created {
            FrameVerdict::StreamError(ErrorCode::StreamClosed)
        } else {
            FrameVerdict::ConnectionError(ErrorCode::ProtocolError)
        }
    }

    fn fail_all_streams(&mut self, error_code: ErrorCode) {
        let ids: Vec<StreamId> = self
            .streams
            .keys()
            .chain(self.promised_streams.keys())
            .copied()
            .collect();
        for stream_id in ids {
            self.events.push_back(H2Event::StreamReset {
                stream_id,
                error_code,
            });
        }
        self.streams.clear();
        self.promised_streams.clear();
        self.blocked_streams.clear();
    }

    // -- Outbound helpers --

    fn send_goaway(&mut self, error_code: ErrorCode) {
        let frame = GoawayFrame::new(self.last_stream_id, error_code, Bytes::new());
        let encoded = FrameCodec::encode_goaway_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);
    }

    fn send_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if let Some(stream) = self.get_stream_mut(stream_id) {
            stream.note_rst_sent();
        }
        let frame = RstStreamFrame {
            stream_id,
            error_code,
        };
        let encoded = FrameCodec::encode_rst_stream_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);
    }

    fn queue_window_update(&mut self, stream_id: StreamId, delta: u32) {
        let frame = WindowUpdateFrame::new(stream_id, delta);
        let encoded = FrameCodec::encode_window_update_frame(&frame);
        self.send_buf.extend_from_slice(&encoded);
    }

    /// Enter the open state once our preface is flushed and the peer's
    /// SETTINGS has been received and acknowledged.
    fn maybe_open(&mut self) {
        if self.state == ConnState::Handshake
            && self.preface_received
            && self.send_buf.is_empty()
        {
            tracing::debug!(role = ?self.role, "connection open");
            self.state = ConnState::Open;
            self.events.push_back(H2Event::Connected);
        }
    }

    /// Re-check blocked streams one by one: the outbound buffer or the
    /// connection window may run out again partway through, in which case
    /// the remaining streams stay blocked.
    fn notify_blocked_streams(&mut self) {
        if !self.send_buf.is_empty() || self.flow.remote_window_size() == 0 {
            return;
        }
        while let Some(&stream_id) = self.blocked_streams.iter().next() {
            if !self.send_buf.is_empty() || self.flow.remote_window_size() == 0 {
                break;
            }
            self.blocked_streams.remove(&stream_id);
            if let Some(stream) = self.get_stream_mut(stream_id) {
                stream.set_write_blocked(false);
                self.events.push_back(H2Event::StreamWritable { stream_id });
            }
        }
    }

    // -- Stream table --

    fn insert_stream(&mut self, stream: H2Stream) {
        let id = stream.id();
        if is_promised_stream(id) {
            self.promised_streams.insert(id, stream);
        } else {
            self.streams.insert(id, stream);
        }
    }

    fn get_stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        if is_promised_stream(stream_id) {
            self.promised_streams.get(&stream_id)
        } else {
            self.streams.get(&stream_id)
        }
    }

    fn get_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        if is_promised_stream(stream_id) {
            self.promised_streams.get_mut(&stream_id)
        } else {
            self.streams.get_mut(&stream_id)
        }
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        if is_promised_stream(stream_id) {
            self.promised_streams.remove(&stream_id);
        } else {
            self.streams.remove(&stream_id);
        }
        self.blocked_streams.remove(&stream_id);
    }

    /// Streams leave the table as soon as they reach the terminal state.
    fn reap_if_closed(&mut self, stream_id: StreamId) {
        if self
            .get_stream(stream_id)
            .is_some_and(|s| s.state().is_closed())
        {
            self.remove_stream(stream_id);
        }
    }
}

/// Pseudo-headers must precede regular headers in a block
/// (RFC 7540 Section 8.1.2.1).
fn validate_pseudo_header_order(headers: &[Header]) -> bool {
    let mut seen_regular = false;
    for header in headers {
        if header.is_pseudo() {
            if seen_regular {
                return false;
            }
        } else {
            seen_regular = true;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive both engines until no bytes remain in flight.
    fn pump(client: &mut H2Connection, server: &mut H2Connection) {
        loop {
            let c = client.take_pending_send();
            if !c.is_empty() {
                server.deliver(&c).unwrap();
            }
            client.notify_writable();
            let s = server.take_pending_send();
            if !s.is_empty() {
                client.deliver(&s).unwrap();
            }
            server.notify_writable();
            if !client.has_pending_send() && !server.has_pending_send() {
                break;
            }
        }
    }

    fn open_pair() -> (H2Connection, H2Connection) {
        let mut client = H2Connection::client();
        let mut server = H2Connection::server();
        client.connect().unwrap();
        client.handle_connected().unwrap();
        server.attach().unwrap();
        pump(&mut client, &mut server);
        assert!(client.is_ready());
        assert!(server.is_ready());
        (client, server)
    }

    fn drain_events(conn: &mut H2Connection) -> Vec<H2Event> {
        let mut events = Vec::new();
        while let Some(event) = conn.poll_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_client_preface_layout() {
        let mut client = H2Connection::client();
        client.connect().unwrap();
        client.handle_connected().unwrap();
        let bytes = client.take_pending_send();
        assert!(bytes.starts_with(CONNECTION_PREFACE));
        // SETTINGS follows the magic.
        assert_eq!(bytes[CONNECTION_PREFACE.len() + 3], 0x4);
    }

    #[test]
    fn test_handshake_reaches_open() {
        let (mut client, mut server) = open_pair();
        assert!(drain_events(&mut client)
            .iter()
            .any(|e| matches!(e, H2Event::Connected)));
        assert!(drain_events(&mut server)
            .iter()
            .any(|e| matches!(e, H2Event::Connected)));
    }

    #[test]
    fn test_server_rejects_bad_preface() {
        let mut server = H2Connection::server();
        server.attach().unwrap();
        let _ = server.take_pending_send();
        let err = server.deliver(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::MissingPreface));
        assert_eq!(server.state(), ConnState::Error);
    }

    #[test]
    fn test_first_frame_must_be_settings() {
        let mut client = H2Connection::client();
        client.connect().unwrap();
        client.handle_connected().unwrap();
        let _ = client.take_pending_send();

        // Server side sends a PING before SETTINGS.
        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([0; 8]));
        let err = client.deliver(&ping).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let events = drain_events(&mut client);
        assert!(events
            .iter()
            .any(|e| matches!(e, H2Event::ConnectionError { error_code }
                if *error_code == ErrorCode::ProtocolError)));
    }

    #[test]
    fn test_request_response_exchange() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);
        drain_events(&mut server);

        let stream_id = client.open_stream().unwrap();
        assert_eq!(stream_id, 1);
        client
            .send_headers(
                stream_id,
                &[
                    Header::new(":method", "POST"),
                    Header::new(":scheme", "https"),
                    Header::new(":path", "/submit"),
                    Header::new(":authority", "example.com"),
                ],
                false,
            )
            .unwrap();
        pump(&mut client, &mut server);
        let sent = client.send_data(stream_id, b"hello body", true).unwrap();
        assert_eq!(sent, 10);
        pump(&mut client, &mut server);

        // Server sees headers then data, stream half-closed remote.
        let events = drain_events(&mut server);
        assert!(matches!(
            &events[0],
            H2Event::Headers { stream_id: 1, end_stream: false, headers }
                if headers[0].value == "POST"
        ));
        assert!(matches!(
            &events[1],
            H2Event::Data { stream_id: 1, end_stream: true, data } if &data[..] == b"hello body"
        ));
        assert_eq!(
            server.stream_state(1),
            Some(StreamState::HalfClosedRemote)
        );

        // Server responds and the stream closes everywhere.
        server
            .send_headers(1, &[Header::new(":status", "200")], true)
            .unwrap();
        assert_eq!(server.stream_state(1), None); // reaped on close
        pump(&mut client, &mut server);

        let events = drain_events(&mut client);
        assert!(matches!(
            &events[0],
            H2Event::Headers { stream_id: 1, end_stream: true, headers }
                if headers[0] == Header::new(":status", "200")
        ));
        assert_eq!(client.stream_state(1), None);
        assert!(!client.has_pending_send());
        assert!(!server.has_pending_send());
    }

    #[test]
    fn test_data_on_idle_stream_fails_connection() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut server);

        // Hand-craft a DATA frame for a stream the client never opened.
        let data = FrameCodec::encode_data_frame(&DataFrame::new(
            7,
            Bytes::from_static(b"x"),
            false,
        ));
        let err = server.deliver(&data).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        assert_eq!(server.state(), ConnState::Error);
        let _ = client;
    }

    #[test]
    fn test_data_after_end_stream_is_stream_error_only() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);
        drain_events(&mut server);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);
        client.send_data(s1, b"done", true).unwrap();
        pump(&mut client, &mut server);
        drain_events(&mut server);

        // More DATA after END_STREAM: stream error, connection stays open.
        let bad = FrameCodec::encode_data_frame(&DataFrame::new(
            s1,
            Bytes::from_static(b"extra"),
            false,
        ));
        server.deliver(&bad).unwrap();
        assert!(server.is_ready());
        pump(&mut server, &mut client);

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::StreamReset { stream_id, error_code }
                if *stream_id == s1 && *error_code == ErrorCode::StreamClosed
        )));
        assert!(client.is_ready());
    }

    #[test]
    fn test_continuation_interleave_fails_connection() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut server);

        // HEADERS without END_HEADERS followed by PING must kill the
        // connection.
        let mut block = Vec::new();
        let mut enc = Encoder::new();
        enc.encode(&[Header::new(":method", "GET")], &mut block);
        let headers = FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            Bytes::from(block),
            false,
            false,
        ));
        server.deliver(&headers).unwrap();
        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([0; 8]));
        let err = server.deliver(&ping).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        let _ = client;
    }

    #[test]
    fn test_continuation_completes_header_block() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut server);

        let mut block = Vec::new();
        let mut enc = Encoder::new();
        enc.encode(
            &[
                Header::new(":method", "GET"),
                Header::new(":path", "/split"),
            ],
            &mut block,
        );
        let mid = block.len() / 2;

        let headers = FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            Bytes::copy_from_slice(&block[..mid]),
            true,
            false,
        ));
        let continuation = FrameCodec::encode_continuation_frame(&ContinuationFrame {
            stream_id: 1,
            header_block: Bytes::copy_from_slice(&block[mid..]),
            end_headers: true,
        });
        server.deliver(&headers).unwrap();
        server.deliver(&continuation).unwrap();

        let events = drain_events(&mut server);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::Headers { stream_id: 1, end_stream: true, headers }
                if headers[1].value == "/split"
        )));
        let _ = client;
    }

    #[test]
    fn test_ping_auto_ack() {
        let (mut client, mut server) = open_pair();
        client.send_ping([7; 8]);
        let bytes = client.take_pending_send();
        server.deliver(&bytes).unwrap();
        let reply = server.take_pending_send();
        // PING ACK: type 0x6, flags ACK, same payload.
        assert_eq!(reply[3], 0x6);
        assert_eq!(reply[4], 0x1);
        assert_eq!(&reply[9..17], &[7; 8]);
    }

    #[test]
    fn test_goaway_fails_streams_and_closes() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);

        server.close();
        pump(&mut server, &mut client);

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::StreamReset { stream_id, .. } if *stream_id == s1
        )));
        assert!(events.iter().any(|e| matches!(e, H2Event::GoAway { .. })));
        assert_eq!(client.state(), ConnState::Closed);
        assert!(!client.wants_more_bytes());
    }

    #[test]
    fn test_settings_initial_window_applies_retroactively() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);

        let before = client
            .get_stream(s1)
            .unwrap()
            .flow_control()
            .remote_window_raw();

        // Server shrinks the initial window by 1000.
        let new_size = server.local_settings.get_initial_window_size() as i64 - 1000;
        let frame = SettingsFrame::new(
            SettingsBuilder::new()
                .initial_window_size(new_size as u32)
                .build()
                .unwrap(),
        );
        let encoded = FrameCodec::encode_settings_frame(&frame);
        client.deliver(&encoded).unwrap();

        let after = client
            .get_stream(s1)
            .unwrap()
            .flow_control()
            .remote_window_raw();
        assert_eq!(after, before - 1000);
    }

    #[test]
    fn test_send_data_blocks_on_stream_window() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "POST")], false)
            .unwrap();
        pump(&mut client, &mut server);

        // Exhaust the stream window artificially.
        let window = client
            .get_stream(s1)
            .unwrap()
            .flow_control()
            .remote_window_size();
        client
            .get_stream_mut(s1)
            .unwrap()
            .flow_control_mut()
            .update_remote_window_size(-(window as i64));

        let sent = client.send_data(s1, b"payload", false).unwrap();
        assert_eq!(sent, 0);
        assert!(client.blocked_streams.contains(&s1));

        // A WINDOW_UPDATE unblocks it.
        let wu = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(s1, 1024));
        client.deliver(&wu).unwrap();
        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::StreamWritable { stream_id } if *stream_id == s1
        )));
        let sent = client.send_data(s1, b"payload", false).unwrap();
        assert_eq!(sent, 7);
        let _ = server;
    }

    #[test]
    fn test_max_concurrent_streams_refused() {
        let mut client = H2Connection::client();
        let mut config = EngineConfig::default_for(Role::Server);
        config.max_concurrent_streams = 1;
        let mut server = H2Connection::with_config(Role::Server, config);
        client.connect().unwrap();
        client.handle_connected().unwrap();
        server.attach().unwrap();
        pump(&mut client, &mut server);
        drain_events(&mut client);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        let s2 = client.open_stream().unwrap();
        client
            .send_headers(s2, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);

        // Second stream refused, first fine, connection open.
        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::StreamReset { stream_id, error_code }
                if *stream_id == s2 && *error_code == ErrorCode::RefusedStream
        )));
        assert!(server.is_ready());
        assert_eq!(server.stream_state(s1), Some(StreamState::Open));
    }

    #[test]
    fn test_accept_hook_refuses_stream() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);
        server.set_accept_hook(Box::new(|stream_id| stream_id != 1));

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::StreamReset { stream_id, error_code }
                if *stream_id == s1 && *error_code == ErrorCode::RefusedStream
        )));
    }

    #[test]
    fn test_push_promise_round_trip() {
        let (mut client, mut server) = open_pair();
        drain_events(&mut client);
        drain_events(&mut server);

        let s1 = client.open_stream().unwrap();
        client
            .send_headers(s1, &[Header::new(":method", "GET")], false)
            .unwrap();
        pump(&mut client, &mut server);
        drain_events(&mut server);

        let promised = server
            .promise_stream(
                s1,
                &[
                    Header::new(":method", "GET"),
                    Header::new(":path", "/style.css"),
                ],
            )
            .unwrap();
        assert!(is_promised_stream(promised));
        pump(&mut server, &mut client);

        let events = drain_events(&mut client);
        assert!(events.iter().any(|e| matches!(
            e,
            H2Event::PushPromise { stream_id, promised_stream_id, headers }
                if *stream_id == s1
                    && *promised_stream_id == promised
                    && headers[1].value == "/style.css"
        )));
        assert_eq!(
            client.stream_state(promised),
            Some(StreamState::ReservedRemote)
        );
    }

    #[test]
    fn test_h2c_upgrade_exchange() {
        let mut client = H2Connection::client();
        let mut server = H2Connection::server();
        client.connect().unwrap();
        client.handle_connected_h2c("example.com").unwrap();
        server.attach_h2c().unwrap();
        pump(&mut client, &mut server);
        assert!(client.is_ready());
        assert!(server.is_ready());
        // Stream id 1 was consumed by the upgrade request.
        assert_eq!(client.open_stream().unwrap(), 3);
    }

    #[test]
    fn test_pseudo_header_order_enforced_on_send() {
        let (mut client, _server) = open_pair();
        let s1 = client.open_stream().unwrap();
        let err = client
            .send_headers(
                s1,
                &[
                    Header::new("accept", "*/*"),
                    Header::new(":method", "GET"),
                ],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
    }
}
