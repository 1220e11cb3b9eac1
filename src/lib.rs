//! h2wire - sans-IO HTTP/2 protocol engine
//!
//! Turns a byte stream from a transport connection into a multiplexed set
//! of logical request/response streams, and turns outgoing header/body data
//! back into correctly framed, flow-controlled, HPACK-compressed bytes
//! (RFC 7540 / RFC 7541).
//!
//! The engine performs no I/O: the transport feeds received bytes in via
//! [`H2Connection::deliver`], pulls outgoing bytes via
//! [`H2Connection::take_pending_send`], and reports flush completion via
//! [`H2Connection::notify_writable`]. Decoded results surface through the
//! [`H2Event`] queue.
//!
//! # Features
//!
//! - Frame codec and resumable assembler for all ten frame types (DATA,
//!   HEADERS, PRIORITY, RST_STREAM, SETTINGS, PUSH_PROMISE, PING, GOAWAY,
//!   WINDOW_UPDATE, CONTINUATION)
//! - HPACK header compression with static + dynamic tables and Huffman
//!   coding, one table per direction
//! - Connection- and stream-level flow control with automatic
//!   WINDOW_UPDATE replenishment
//! - RFC 7540 Section 5.1 stream state machine with strict per-state frame
//!   admission
//! - Preface/SETTINGS handshake, h2c upgrade, GOAWAY teardown
//! - Cooperative back-pressure: blocked streams re-try on
//!   [`H2Event::StreamWritable`]
//!
//! # Example
//!
//! ```
//! use h2wire::{H2Connection, H2Event, Header};
//!
//! let mut client = H2Connection::client();
//! let mut server = H2Connection::server();
//! client.connect().unwrap();
//! client.handle_connected().unwrap();
//! server.attach().unwrap();
//!
//! // Shuttle handshake bytes between the two engines.
//! let bytes = client.take_pending_send();
//! server.deliver(&bytes).unwrap();
//! let bytes = server.take_pending_send();
//! client.deliver(&bytes).unwrap();
//! server.notify_writable();
//! let bytes = client.take_pending_send();
//! server.deliver(&bytes).unwrap();
//! client.notify_writable();
//! assert!(client.is_ready() && server.is_ready());
//!
//! // Send a request.
//! let stream_id = client.open_stream().unwrap();
//! client
//!     .send_headers(
//!         stream_id,
//!         &[
//!             Header::new(":method", "GET"),
//!             Header::new(":scheme", "https"),
//!             Header::new(":path", "/"),
//!             Header::new(":authority", "example.com"),
//!         ],
//!         true,
//!     )
//!     .unwrap();
//! let bytes = client.take_pending_send();
//! server.deliver(&bytes).unwrap();
//!
//! while let Some(event) = server.poll_event() {
//!     if let H2Event::Headers { stream_id, headers, end_stream } = event {
//!         assert_eq!(stream_id, 1);
//!         assert!(end_stream);
//!         assert_eq!(headers[0].value, "GET");
//!     }
//! }
//! ```

pub mod assembler;
pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod hpack;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod upgrade;

pub use connection::{ConnState, EngineConfig, H2Connection, H2Event, Role};
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameHeader, FrameType};
pub use hpack::{Header, HeaderList, IndexingPolicy};
pub use registry::ConnectionRegistry;
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;

/// Maximum flow control window size (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFFFFFF;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
