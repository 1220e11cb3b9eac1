//! Incremental HTTP/2 frame assembly
//!
//! [`FrameAssembler`] accepts arbitrary-sized byte chunks from the
//! transport, buffers partial frame headers and payloads across calls, and
//! yields complete decoded frames in arrival order. It holds at most one
//! frame's worth of bytes - memory use is bounded by the advertised maximum
//! frame size, never by the input.

use super::codec::{FrameCodec, FRAME_HEADER_SIZE};
use super::error::{frame_size_error_scope, Error, ErrorCode, ErrorScope};
use super::frames::{Frame, FrameHeader};

/// Output of one assembly step: a complete frame, or a stream-scoped
/// framing error the dispatcher answers with RST_STREAM while parsing
/// continues.
#[derive(Debug)]
pub enum Assembled {
    /// A complete decoded frame.
    Frame(Frame),
    /// A recoverable, stream-scoped framing error. The offending payload
    /// has been discarded; subsequent frames are unaffected.
    StreamError {
        header: FrameHeader,
        code: ErrorCode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Accumulating the 9-byte frame header (possibly split across calls).
    Header,
    /// Accumulating `header.length` payload bytes.
    Payload,
    /// Discarding the payload of a frame already reported as a stream error.
    Skip,
    /// A connection-scoped failure occurred; the assembler is unusable.
    Poisoned,
}

/// Resumable frame parser.
pub struct FrameAssembler {
    max_frame_size: u32,
    state: ReadState,
    hdr_buf: Vec<u8>,
    header: Option<FrameHeader>,
    payload: Vec<u8>,
    skip_remaining: usize,
}

impl FrameAssembler {
    /// Create an assembler enforcing the locally-advertised max frame size.
    pub fn new(max_frame_size: u32) -> Self {
        FrameAssembler {
            max_frame_size,
            state: ReadState::Header,
            hdr_buf: Vec::with_capacity(FRAME_HEADER_SIZE),
            header: None,
            payload: Vec::new(),
            skip_remaining: 0,
        }
    }

    /// Update the enforced maximum frame size (local SETTINGS change).
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Feed a chunk of transport bytes.
    ///
    /// All input is consumed; zero or more results are appended to `out`.
    /// A connection-fatal error (oversized HEADERS/SETTINGS/PUSH_PROMISE/
    /// WINDOW_UPDATE, malformed payload of a connection-scoped kind)
    /// poisons the assembler and is returned as `Err`.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<Assembled>) -> Result<(), Error> {
        let mut input = data;

        while !input.is_empty() {
            match self.state {
                ReadState::Poisoned => {
                    return Err(Error::Protocol(
                        "frame assembler already failed".to_string(),
                    ));
                }
                ReadState::Header => {
                    if self.hdr_buf.len() + input.len() < FRAME_HEADER_SIZE {
                        self.hdr_buf.extend_from_slice(input);
                        return Ok(()); // need more data
                    }
                    let header = if self.hdr_buf.is_empty() {
                        let header = FrameCodec::decode_header(input)?;
                        input = &input[FRAME_HEADER_SIZE..];
                        header
                    } else {
                        let need = FRAME_HEADER_SIZE - self.hdr_buf.len();
                        self.hdr_buf.extend_from_slice(&input[..need]);
                        input = &input[need..];
                        let header = FrameCodec::decode_header(&self.hdr_buf)?;
                        self.hdr_buf.clear();
                        header
                    };

                    if header.length > self.max_frame_size {
                        match frame_size_error_scope(header.frame_type, header.stream_id) {
                            ErrorScope::Connection => {
                                self.state = ReadState::Poisoned;
                                return Err(Error::FrameSize(format!(
                                    "frame length {} exceeds max frame size {}",
                                    header.length, self.max_frame_size
                                )));
                            }
                            ErrorScope::Stream => {
                                tracing::warn!(
                                    stream_id = header.stream_id,
                                    length = header.length,
                                    "oversized frame, resetting stream"
                                );
                                out.push(Assembled::StreamError {
                                    header,
                                    code: ErrorCode::FrameSizeError,
                                });
                                self.skip_remaining = header.length as usize;
                                self.state = if self.skip_remaining == 0 {
                                    ReadState::Header
                                } else {
                                    ReadState::Skip
                                };
                                continue;
                            }
                        }
                    }

                    self.header = Some(header);
                    self.payload.clear();
                    self.state = ReadState::Payload;
                }
                ReadState::Payload => {
                    let header = self.header.expect("payload state without header");
                    let want = header.length as usize - self.payload.len();

                    if input.len() >= want && self.payload.is_empty() {
                        // Whole payload available in this chunk - decode
                        // without copying into the holding buffer.
                        self.emit(&header, &input[..want], out)?;
                        input = &input[want..];
                        self.state = ReadState::Header;
                        self.header = None;
                    } else if input.len() >= want {
                        self.payload.extend_from_slice(&input[..want]);
                        input = &input[want..];
                        let payload = std::mem::take(&mut self.payload);
                        self.emit(&header, &payload, out)?;
                        self.state = ReadState::Header;
                        self.header = None;
                    } else {
                        self.payload.extend_from_slice(input);
                        return Ok(()); // need more data
                    }
                }
                ReadState::Skip => {
                    let n = self.skip_remaining.min(input.len());
                    self.skip_remaining -= n;
                    input = &input[n..];
                    if self.skip_remaining == 0 {
                        self.state = ReadState::Header;
                    }
                }
            }
        }

        Ok(())
    }

    fn emit(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        out: &mut Vec<Assembled>,
    ) -> Result<(), Error> {
        match FrameCodec::decode_payload(header, payload) {
            Ok(frame) => {
                out.push(Assembled::Frame(frame));
                Ok(())
            }
            Err(err) => {
                let scope = match &err {
                    Error::FrameSize(_) => {
                        frame_size_error_scope(header.frame_type, header.stream_id)
                    }
                    // Payload-level protocol violations (bad padding, wrong
                    // scope) always fail the connection.
                    _ => ErrorScope::Connection,
                };
                match scope {
                    ErrorScope::Connection => {
                        self.state = ReadState::Poisoned;
                        Err(err)
                    }
                    ErrorScope::Stream => {
                        out.push(Assembled::StreamError {
                            header: *header,
                            code: err.error_code(),
                        });
                        Ok(())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{DataFrame, FrameFlags, FrameType, PingFrame};
    use bytes::Bytes;

    fn feed_all(assembler: &mut FrameAssembler, data: &[u8]) -> Vec<Assembled> {
        let mut out = Vec::new();
        assembler.feed(data, &mut out).unwrap();
        out
    }

    #[test]
    fn test_single_frame_single_feed() {
        let mut assembler = FrameAssembler::new(16384);
        let encoded = FrameCodec::encode_data_frame(&DataFrame::new(1, Bytes::from("hello"), true));
        let out = feed_all(&mut assembler, &encoded);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Assembled::Frame(Frame::Data(f)) => assert_eq!(&f.data[..], b"hello"),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_split_byte_by_byte() {
        let mut assembler = FrameAssembler::new(16384);
        let encoded = FrameCodec::encode_ping_frame(&PingFrame::new([9; 8]));

        let mut out = Vec::new();
        for byte in encoded.iter() {
            assembler.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        match &out[0] {
            Assembled::Frame(Frame::Ping(f)) => assert_eq!(f.data, [9; 8]),
            other => panic!("expected PING, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_frames_one_feed() {
        let mut assembler = FrameAssembler::new(16384);
        let mut wire = Vec::new();
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from("one"),
            false,
        )));
        wire.extend_from_slice(&FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from("two"),
            true,
        )));
        let out = feed_all(&mut assembler, &wire);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_split_across_header_boundary() {
        let mut assembler = FrameAssembler::new(16384);
        let encoded = FrameCodec::encode_data_frame(&DataFrame::new(1, Bytes::from("body"), false));

        let mut out = Vec::new();
        assembler.feed(&encoded[..4], &mut out).unwrap();
        assert!(out.is_empty());
        assembler.feed(&encoded[4..11], &mut out).unwrap();
        assert!(out.is_empty());
        assembler.feed(&encoded[11..], &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_oversized_data_is_stream_scoped_and_recoverable() {
        let mut assembler = FrameAssembler::new(16);

        // Declare a 32-byte DATA payload against a 16-byte limit.
        let mut wire = Vec::new();
        wire.extend_from_slice(&FrameCodec::encode_header(
            FrameType::Data.as_u8(),
            FrameFlags::empty(),
            3,
            32,
        ));
        wire.extend_from_slice(&[0u8; 32]);
        // A well-sized PING follows the bad frame.
        wire.extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::new([1; 8])));

        let out = feed_all(&mut assembler, &wire);
        assert_eq!(out.len(), 2);
        match &out[0] {
            Assembled::StreamError { header, code } => {
                assert_eq!(header.stream_id, 3);
                assert_eq!(*code, ErrorCode::FrameSizeError);
            }
            other => panic!("expected StreamError, got {other:?}"),
        }
        assert!(matches!(out[1], Assembled::Frame(Frame::Ping(_))));
    }

    #[test]
    fn test_oversized_headers_is_connection_fatal() {
        let mut assembler = FrameAssembler::new(16);
        let wire = FrameCodec::encode_header(
            FrameType::Headers.as_u8(),
            FrameFlags::empty(),
            3,
            32,
        );
        let mut out = Vec::new();
        let err = assembler.feed(&wire, &mut out).unwrap_err();
        assert!(matches!(err, Error::FrameSize(_)));

        // Poisoned afterwards.
        assert!(assembler.feed(&[0], &mut out).is_err());
    }

    #[test]
    fn test_bad_rst_stream_length_is_stream_scoped() {
        let mut assembler = FrameAssembler::new(16384);
        let mut wire = Vec::new();
        wire.extend_from_slice(&FrameCodec::encode_header(
            FrameType::RstStream.as_u8(),
            FrameFlags::empty(),
            5,
            3,
        ));
        wire.extend_from_slice(&[0, 0, 8]);
        let out = feed_all(&mut assembler, &wire);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Assembled::StreamError { header, code } => {
                assert_eq!(header.stream_id, 5);
                assert_eq!(*code, ErrorCode::FrameSizeError);
            }
            other => panic!("expected StreamError, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_bad_length_is_connection_fatal() {
        let mut assembler = FrameAssembler::new(16384);
        let mut wire = Vec::new();
        wire.extend_from_slice(&FrameCodec::encode_header(
            FrameType::Settings.as_u8(),
            FrameFlags::empty(),
            0,
            5,
        ));
        wire.extend_from_slice(&[0, 4, 0, 0, 0]);
        let mut out = Vec::new();
        let err = assembler.feed(&wire, &mut out).unwrap_err();
        assert!(matches!(err, Error::FrameSize(_)));
    }
}
