//! HTTP/2 frame encoding and decoding
//!
//! Pure functions over byte buffers: the 9-byte frame header and the ten
//! frame-type payloads (RFC 7540 Section 6). Stateful, incremental parsing
//! lives in [`crate::assembler`]; this module works on one complete frame
//! at a time.

use super::error::{Error, Result};
use super::frames::*;
use super::settings::{Settings, SETTING_ITEM_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload length expressible in the 24-bit length field (16MB - 1)
pub const MAX_FRAME_PAYLOAD: usize = 0x00FF_FFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header into a 9-byte array
    pub fn encode_header(
        frame_type: u8,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        // Type (8 bits)
        header[3] = frame_type;

        // Flags (8 bits)
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5] = ((stream_id >> 24) & 0xFF) as u8;
        header[6] = ((stream_id >> 16) & 0xFF) as u8;
        header[7] = ((stream_id >> 8) & 0xFF) as u8;
        header[8] = (stream_id & 0xFF) as u8;

        header
    }

    /// Decode a frame header from bytes
    ///
    /// Fails if fewer than 9 bytes are available.
    pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::FrameSize(
                "frame header needs 9 bytes".to_string(),
            ));
        }

        let length = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);
        let frame_type = bytes[3];
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, reserved bit masked)
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        Ok(FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize; // 1 byte for length + padding
            pad_len
        } else {
            0
        };

        let header =
            Self::encode_header(FrameType::Data.as_u8(), flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        buf.put_slice(&frame.data);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5; // 4 bytes dependency + 1 byte weight
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header =
            Self::encode_header(FrameType::Headers.as_u8(), flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        if let Some(priority) = &frame.priority {
            put_priority(&mut buf, priority);
        }

        buf.put_slice(&frame.header_block);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(
            FrameType::Priority.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            5,
        );
        buf.put_slice(&header);
        put_priority(&mut buf, &frame.priority);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(
            FrameType::RstStream.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.error_code.as_u32());

        buf.freeze()
    }

    /// Encode a SETTINGS frame (stream ID is always 0)
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let payload = if frame.ack {
            Vec::new()
        } else {
            frame.settings.encode_to_vec()
        };

        let header = Self::encode_header(FrameType::Settings.as_u8(), flags, 0, payload.len());
        buf.put_slice(&header);
        buf.put_slice(&payload);

        buf.freeze()
    }

    /// Encode a PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = 4 + frame.header_block.len();
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(
            FrameType::PushPromise.as_u8(),
            flags,
            frame.stream_id,
            payload_len,
        );
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }

        buf.put_u32(frame.promised_stream_id & 0x7FFFFFFF);
        buf.put_slice(&frame.header_block);

        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a PING frame (payload is always 8 bytes, stream ID 0)
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let header = Self::encode_header(FrameType::Ping.as_u8(), flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame (stream ID is always 0)
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let payload_len = 8 + frame.debug_data.len();

        let header = Self::encode_header(
            FrameType::Goaway.as_u8(),
            FrameFlags::empty(),
            0,
            payload_len,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame (payload is always 4 bytes)
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let header = Self::encode_header(
            FrameType::WindowUpdate.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        buf.put_slice(&header);
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(
            FrameType::Continuation.as_u8(),
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode any frame (header + payload)
    pub fn encode_frame(frame: &Frame) -> Bytes {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f),
            Frame::Headers(f) => Self::encode_headers_frame(f),
            Frame::Priority(f) => Self::encode_priority_frame(f),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(f),
            Frame::Settings(f) => Self::encode_settings_frame(f),
            Frame::PushPromise(f) => Self::encode_push_promise_frame(f),
            Frame::Ping(f) => Self::encode_ping_frame(f),
            Frame::Goaway(f) => Self::encode_goaway_frame(f),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(f),
            Frame::Continuation(f) => Self::encode_continuation_frame(f),
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                let mut buf = BytesMut::new();
                let header =
                    Self::encode_header(*frame_type, *flags, *stream_id, payload.len());
                buf.put_slice(&header);
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    /// Decode a frame payload given its already-decoded header.
    ///
    /// Performs the per-type size and scope checks from RFC 7540 Section 6.
    /// Frame-size violations come back as [`Error::FrameSize`], scope
    /// violations as [`Error::Protocol`]; the caller maps them onto
    /// connection vs stream severity.
    pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Frame> {
        debug_assert_eq!(payload.len(), header.length as usize);
        let flags = header.flags;
        let stream_id = header.stream_id;

        let frame_type = match FrameType::from_u8(header.frame_type) {
            Some(t) => t,
            None => {
                // Unknown frame types must be ignored (RFC 7540 Section 4.1).
                return Ok(Frame::Unknown {
                    frame_type: header.frame_type,
                    flags,
                    stream_id,
                    payload: Bytes::copy_from_slice(payload),
                });
            }
        };

        match frame_type {
            FrameType::Data => {
                if stream_id == 0 {
                    return Err(Error::Protocol("DATA frame on stream 0".to_string()));
                }
                let (data, padding) = strip_padding(payload, flags)?;
                Ok(Frame::Data(DataFrame {
                    stream_id,
                    data: Bytes::copy_from_slice(data),
                    end_stream: flags.is_end_stream(),
                    padding,
                }))
            }
            FrameType::Headers => {
                if stream_id == 0 {
                    return Err(Error::Protocol("HEADERS frame on stream 0".to_string()));
                }
                let (data, padding) = strip_padding(payload, flags)?;
                let (priority, block) = if flags.is_priority() {
                    if data.len() < 5 {
                        return Err(Error::FrameSize(
                            "HEADERS priority section needs 5 bytes".to_string(),
                        ));
                    }
                    (Some(get_priority(data)), &data[5..])
                } else {
                    (None, data)
                };
                Ok(Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: Bytes::copy_from_slice(block),
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                }))
            }
            FrameType::Priority => {
                if stream_id == 0 {
                    return Err(Error::Protocol("PRIORITY frame on stream 0".to_string()));
                }
                if payload.len() != 5 {
                    return Err(Error::FrameSize(
                        "PRIORITY payload must be 5 bytes".to_string(),
                    ));
                }
                Ok(Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: get_priority(payload),
                }))
            }
            FrameType::RstStream => {
                if stream_id == 0 {
                    return Err(Error::Protocol("RST_STREAM frame on stream 0".to_string()));
                }
                if payload.len() != 4 {
                    return Err(Error::FrameSize(
                        "RST_STREAM payload must be 4 bytes".to_string(),
                    ));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id,
                    error_code: super::error::ErrorCode::from_u32(code),
                }))
            }
            FrameType::Settings => {
                if stream_id != 0 {
                    return Err(Error::Protocol(
                        "SETTINGS frame on non-zero stream".to_string(),
                    ));
                }
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(Error::FrameSize(
                            "SETTINGS ACK must have empty payload".to_string(),
                        ));
                    }
                    Ok(Frame::Settings(SettingsFrame::ack()))
                } else {
                    if payload.len() % SETTING_ITEM_SIZE != 0 {
                        return Err(Error::FrameSize(
                            "SETTINGS payload length not a multiple of 6".to_string(),
                        ));
                    }
                    let settings = Settings::decode(payload)?;
                    Ok(Frame::Settings(SettingsFrame::new(settings)))
                }
            }
            FrameType::PushPromise => {
                if stream_id == 0 {
                    return Err(Error::Protocol(
                        "PUSH_PROMISE frame on stream 0".to_string(),
                    ));
                }
                let (data, padding) = strip_padding(payload, flags)?;
                if data.len() < 4 {
                    return Err(Error::FrameSize(
                        "PUSH_PROMISE payload needs promised stream id".to_string(),
                    ));
                }
                let promised =
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7FFFFFFF;
                Ok(Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id: promised,
                    header_block: Bytes::copy_from_slice(&data[4..]),
                    end_headers: flags.is_end_headers(),
                    padding,
                }))
            }
            FrameType::Ping => {
                if stream_id != 0 {
                    return Err(Error::Protocol(
                        "PING frame on non-zero stream".to_string(),
                    ));
                }
                if payload.len() != 8 {
                    return Err(Error::FrameSize(
                        "PING payload must be 8 bytes".to_string(),
                    ));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(payload);
                Ok(Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                if stream_id != 0 {
                    return Err(Error::Protocol(
                        "GOAWAY frame on non-zero stream".to_string(),
                    ));
                }
                if payload.len() < 8 {
                    return Err(Error::FrameSize(
                        "GOAWAY payload needs 8 bytes".to_string(),
                    ));
                }
                let last =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFFFFFF;
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Frame::Goaway(GoawayFrame {
                    last_stream_id: last,
                    error_code: super::error::ErrorCode::from_u32(code),
                    debug_data: Bytes::copy_from_slice(&payload[8..]),
                }))
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(Error::FrameSize(
                        "WINDOW_UPDATE payload must be 4 bytes".to_string(),
                    ));
                }
                let increment =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & 0x7FFFFFFF;
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    size_increment: increment,
                }))
            }
            FrameType::Continuation => {
                if stream_id == 0 {
                    return Err(Error::Protocol(
                        "CONTINUATION frame on stream 0".to_string(),
                    ));
                }
                Ok(Frame::Continuation(ContinuationFrame {
                    stream_id,
                    header_block: Bytes::copy_from_slice(payload),
                    end_headers: flags.is_end_headers(),
                }))
            }
        }
    }
}

/// Write the 5-byte priority section: dependency with exclusive bit, then
/// weight as `weight - 1` on the wire.
fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
    let mut dep = priority.stream_dependency & 0x7FFFFFFF;
    if priority.exclusive {
        dep |= 0x80000000;
    }
    buf.put_u32(dep);
    buf.put_u8((priority.weight.clamp(1, 256) - 1) as u8);
}

/// Read the 5-byte priority section (caller has verified the length).
fn get_priority(data: &[u8]) -> PrioritySpec {
    let dep_raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    PrioritySpec {
        stream_dependency: dep_raw & 0x7FFFFFFF,
        exclusive: dep_raw & 0x80000000 != 0,
        weight: data[4] as u16 + 1,
    }
}

/// Strip padding from a frame payload if the PADDED flag is set.
///
/// RFC 7540 Section 6.1: a pad length >= the remaining payload length is a
/// PROTOCOL_ERROR.
fn strip_padding(payload: &[u8], flags: FrameFlags) -> Result<(&[u8], Option<u8>)> {
    if flags.is_padded() {
        if payload.is_empty() {
            return Err(Error::FrameSize(
                "padded frame missing pad length".to_string(),
            ));
        }
        let pad_len = payload[0];
        if pad_len as usize >= payload.len() {
            return Err(Error::Protocol("padding exceeds payload".to_string()));
        }
        Ok((
            &payload[1..payload.len() - pad_len as usize],
            Some(pad_len),
        ))
    } else {
        Ok((payload, None))
    }
}
