//! HTTP/2 integration tests
//!
//! Two engines wired back-to-back exercise the full paths: handshake,
//! request/response exchange, flow control, continuation ordering, error
//! isolation, teardown, and the h2c upgrade.

use bytes::Bytes;
use h2wire::codec::FrameCodec;
use h2wire::frames::{ContinuationFrame, DataFrame, HeadersFrame, PingFrame};
use h2wire::hpack::Encoder;
use h2wire::{
    ConnState, ConnectionRegistry, EngineConfig, Error, ErrorCode, H2Connection, H2Event, Header,
    Role, StreamState,
};
use std::sync::Arc;

/// Shuttle bytes between the two engines until both are quiescent.
fn pump(a: &mut H2Connection, b: &mut H2Connection) {
    loop {
        let from_a = a.take_pending_send();
        if !from_a.is_empty() {
            b.deliver(&from_a).unwrap();
        }
        a.notify_writable();
        let from_b = b.take_pending_send();
        if !from_b.is_empty() {
            a.deliver(&from_b).unwrap();
        }
        b.notify_writable();
        if !a.has_pending_send() && !b.has_pending_send() {
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
    drain(&mut client);
    drain(&mut server);
    (client, server)
}

fn drain(conn: &mut H2Connection) -> Vec<H2Event> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll_event() {
        events.push(event);
    }
    events
}

fn request_headers(path: &str) -> Vec<Header> {
    vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "https"),
        Header::new(":path", path),
        Header::new(":authority", "example.com"),
    ]
}

#[test]
fn end_to_end_request_response() {
    let (mut client, mut server) = open_pair();

    // Client: HEADERS (END_HEADERS, no END_STREAM) + DATA (END_STREAM).
    let stream_id = client.open_stream().unwrap();
    client
        .send_headers(stream_id, &request_headers("/upload"), false)
        .unwrap();
    pump(&mut client, &mut server);
    let sent = client.send_data(stream_id, b"request body", true).unwrap();
    assert_eq!(sent, 12);
    pump(&mut client, &mut server);

    // Server decoded headers and received the full body; its stream went
    // idle -> open -> half-closed (remote).
    let events = drain(&mut server);
    match &events[0] {
        H2Event::Headers {
            stream_id: sid,
            headers,
            end_stream,
        } => {
            assert_eq!(*sid, stream_id);
            assert!(!end_stream);
            assert_eq!(headers[2].value, "/upload");
        }
        other => panic!("expected Headers, got {other:?}"),
    }
    match &events[1] {
        H2Event::Data {
            stream_id: sid,
            data,
            end_stream,
        } => {
            assert_eq!(*sid, stream_id);
            assert!(end_stream);
            assert_eq!(&data[..], b"request body");
        }
        other => panic!("expected Data, got {other:?}"),
    }
    assert_eq!(
        server.stream_state(stream_id),
        Some(StreamState::HalfClosedRemote)
    );

    // Server responds HEADERS (END_HEADERS, END_STREAM); the stream
    // reaches closed on both sides and leaves the tables.
    server
        .send_headers(
            stream_id,
            &[
                Header::new(":status", "200"),
                Header::new("content-type", "text/plain"),
            ],
            true,
        )
        .unwrap();
    pump(&mut server, &mut client);

    let events = drain(&mut client);
    match &events[0] {
        H2Event::Headers {
            headers,
            end_stream,
            ..
        } => {
            assert!(end_stream);
            assert_eq!(headers[0], Header::new(":status", "200"));
        }
        other => panic!("expected Headers, got {other:?}"),
    }
    assert_eq!(client.stream_state(stream_id), None);
    assert_eq!(server.stream_state(stream_id), None);

    // No bytes remain buffered in either direction.
    assert!(!client.has_pending_send());
    assert!(!server.has_pending_send());
}

#[test]
fn multiple_concurrent_streams() {
    let (mut client, mut server) = open_pair();

    let s1 = client.open_stream().unwrap();
    let s2 = client.open_stream().unwrap();
    let s3 = client.open_stream().unwrap();
    assert_eq!((s1, s2, s3), (1, 3, 5));

    for (sid, path) in [(s1, "/a"), (s2, "/b"), (s3, "/c")] {
        client
            .send_headers(sid, &request_headers(path), true)
            .unwrap();
    }
    pump(&mut client, &mut server);

    let events = drain(&mut server);
    let paths: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            H2Event::Headers { headers, .. } => Some(headers[2].value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(paths, vec!["/a", "/b", "/c"]);

    // Respond out of order; each client stream closes independently.
    for sid in [s3, s1, s2] {
        server
            .send_headers(sid, &[Header::new(":status", "204")], true)
            .unwrap();
    }
    pump(&mut server, &mut client);
    let responses = drain(&mut client)
        .iter()
        .filter(|e| matches!(e, H2Event::Headers { .. }))
        .count();
    assert_eq!(responses, 3);
}

#[test]
fn large_body_respects_frame_size() {
    let (mut client, mut server) = open_pair();

    let stream_id = client.open_stream().unwrap();
    client
        .send_headers(stream_id, &request_headers("/big"), false)
        .unwrap();
    pump(&mut client, &mut server);

    // 200KB body: larger than one max-size frame, smaller than the windows.
    let body = vec![0xabu8; 200_000];
    let mut offset = 0;
    while offset < body.len() {
        let sent = client.send_data(stream_id, &body[offset..], true).unwrap();
        assert!(sent > 0, "windows are large enough that sends progress");
        offset += sent;
        pump(&mut client, &mut server);
    }

    let mut received = Vec::new();
    let mut ended = false;
    for event in drain(&mut server) {
        if let H2Event::Data {
            data, end_stream, ..
        } = event
        {
            received.extend_from_slice(&data);
            ended = end_stream;
        }
    }
    assert_eq!(received.len(), body.len());
    assert!(ended);
}

#[test]
fn data_in_idle_is_connection_error() {
    let (mut client, mut server) = open_pair();

    let rogue = FrameCodec::encode_data_frame(&DataFrame::new(9, Bytes::from_static(b"x"), false));
    let err = server.deliver(&rogue).unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ProtocolError);
    assert_eq!(server.state(), ConnState::Error);

    let events = drain(&mut server);
    assert!(events.iter().any(|e| matches!(
        e,
        H2Event::ConnectionError { error_code } if *error_code == ErrorCode::ProtocolError
    )));
    let _ = client;
}

#[test]
fn stream_error_leaves_other_streams_untouched() {
    let (mut client, mut server) = open_pair();

    let s1 = client.open_stream().unwrap();
    let s2 = client.open_stream().unwrap();
    client
        .send_headers(s1, &request_headers("/finished"), false)
        .unwrap();
    client
        .send_headers(s2, &request_headers("/alive"), false)
        .unwrap();
    pump(&mut client, &mut server);
    client.send_data(s1, b"done", true).unwrap();
    pump(&mut client, &mut server);
    drain(&mut server);

    // DATA on the half-closed stream: stream error STREAM_CLOSED only.
    let bad = FrameCodec::encode_data_frame(&DataFrame::new(s1, Bytes::from_static(b"!"), false));
    server.deliver(&bad).unwrap();
    assert!(server.is_ready());
    assert_eq!(server.stream_state(s2), Some(StreamState::Open));
    pump(&mut server, &mut client);

    let events = drain(&mut client);
    assert!(events.iter().any(|e| matches!(
        e,
        H2Event::StreamReset { stream_id, error_code }
            if *stream_id == s1 && *error_code == ErrorCode::StreamClosed
    )));

    // The surviving stream still works end to end.
    server
        .send_headers(s2, &[Header::new(":status", "200")], true)
        .unwrap();
    pump(&mut server, &mut client);
    assert!(drain(&mut client)
        .iter()
        .any(|e| matches!(e, H2Event::Headers { stream_id, .. } if *stream_id == s2)));
}

#[test]
fn continuation_interleave_is_connection_error() {
    let (mut client, mut server) = open_pair();

    let mut encoder = Encoder::new();
    let mut block = Vec::new();
    encoder.encode(&request_headers("/split"), &mut block);
    let mid = block.len() / 2;

    let first = FrameCodec::encode_headers_frame(&HeadersFrame::new(
        1,
        Bytes::copy_from_slice(&block[..mid]),
        false,
        false, // no END_HEADERS
    ));
    server.deliver(&first).unwrap();

    // A PING for the connection before the matching CONTINUATION.
    let ping = FrameCodec::encode_ping_frame(&PingFrame::new([1; 8]));
    let err = server.deliver(&ping).unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ProtocolError);
    assert_eq!(server.state(), ConnState::Error);
    let _ = client;
}

#[test]
fn continuation_sequence_decodes_atomically() {
    let (mut client, mut server) = open_pair();

    let mut encoder = Encoder::new();
    let mut block = Vec::new();
    encoder.encode(&request_headers("/three-part"), &mut block);
    let third = block.len() / 3;

    let frames = [
        FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            Bytes::copy_from_slice(&block[..third]),
            true,
            false,
        )),
        FrameCodec::encode_continuation_frame(&ContinuationFrame {
            stream_id: 1,
            header_block: Bytes::copy_from_slice(&block[third..2 * third]),
            end_headers: false,
        }),
        FrameCodec::encode_continuation_frame(&ContinuationFrame {
            stream_id: 1,
            header_block: Bytes::copy_from_slice(&block[2 * third..]),
            end_headers: true,
        }),
    ];
    for frame in &frames {
        server.deliver(frame).unwrap();
    }

    let events = drain(&mut server);
    assert!(events.iter().any(|e| matches!(
        e,
        H2Event::Headers { stream_id: 1, end_stream: true, headers }
            if headers[2].value == "/three-part"
    )));
    let _ = client;
}

#[test]
fn window_exhaustion_blocks_and_window_update_resumes() {
    // Tiny stream windows so a modest body exhausts them.
    let mut client_config = EngineConfig::default_for(Role::Client);
    client_config.settings = h2wire::SettingsBuilder::new()
        .initial_window_size(64)
        .max_frame_size(16384)
        .build()
        .unwrap();
    let mut server_config = EngineConfig::default_for(Role::Server);
    server_config.settings = h2wire::SettingsBuilder::new()
        .initial_window_size(64)
        .max_frame_size(16384)
        .max_concurrent_streams(16)
        .build()
        .unwrap();
    let mut client = H2Connection::with_config(Role::Client, client_config);
    let mut server = H2Connection::with_config(Role::Server, server_config);
    client.connect().unwrap();
    client.handle_connected().unwrap();
    server.attach().unwrap();
    pump(&mut client, &mut server);
    drain(&mut client);
    drain(&mut server);

    let stream_id = client.open_stream().unwrap();
    client
        .send_headers(stream_id, &request_headers("/slow"), false)
        .unwrap();
    pump(&mut client, &mut server);

    // Only 64 bytes fit in the stream window.
    let body = [0x55u8; 200];
    let sent = client.send_data(stream_id, &body, false).unwrap();
    assert_eq!(sent, 64);
    let blocked = client.send_data(stream_id, &body[sent..], false).unwrap();
    assert_eq!(blocked, 0);

    // The server consumes the data; its auto-replenish WINDOW_UPDATE
    // reopens the stream window and the client learns it may write again.
    pump(&mut client, &mut server);
    let writable: Vec<_> = drain(&mut client)
        .into_iter()
        .filter(|e| matches!(e, H2Event::StreamWritable { stream_id: sid } if *sid == stream_id))
        .collect();
    assert!(!writable.is_empty(), "expected StreamWritable after update");

    let resumed = client.send_data(stream_id, &body[64..], false).unwrap();
    assert!(resumed > 0);
}

#[test]
fn goaway_fails_all_streams() {
    let (mut client, mut server) = open_pair();

    let s1 = client.open_stream().unwrap();
    let s2 = client.open_stream().unwrap();
    client
        .send_headers(s1, &request_headers("/one"), false)
        .unwrap();
    client
        .send_headers(s2, &request_headers("/two"), false)
        .unwrap();
    pump(&mut client, &mut server);

    server.close();
    pump(&mut server, &mut client);

    let events = drain(&mut client);
    let reset_ids: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            H2Event::StreamReset { stream_id, .. } => Some(*stream_id),
            _ => None,
        })
        .collect();
    assert!(reset_ids.contains(&s1));
    assert!(reset_ids.contains(&s2));
    assert!(events.iter().any(|e| matches!(
        e,
        H2Event::GoAway { error_code, .. } if *error_code == ErrorCode::NoError
    )));
    assert_eq!(client.state(), ConnState::Closed);
    assert!(!client.wants_more_bytes());
}

#[test]
fn h2c_upgrade_end_to_end() {
    let mut client = H2Connection::client();
    let mut server = H2Connection::server();
    client.connect().unwrap();
    client.handle_connected_h2c("example.com").unwrap();
    server.attach_h2c().unwrap();
    pump(&mut client, &mut server);
    assert!(client.is_ready());
    assert!(server.is_ready());
    drain(&mut client);
    drain(&mut server);

    // Stream 1 is reserved for the upgrade request; new streams start at 3.
    let stream_id = client.open_stream().unwrap();
    assert_eq!(stream_id, 3);
    client
        .send_headers(stream_id, &request_headers("/after-upgrade"), true)
        .unwrap();
    pump(&mut client, &mut server);
    assert!(drain(&mut server).iter().any(|e| matches!(
        e,
        H2Event::Headers { stream_id: 3, .. }
    )));
}

#[test]
fn deliver_fails_after_connection_error() {
    let (mut client, mut server) = open_pair();
    let rogue = FrameCodec::encode_data_frame(&DataFrame::new(9, Bytes::new(), false));
    assert!(server.deliver(&rogue).is_err());
    // Engine is done; further input is rejected.
    assert!(matches!(server.deliver(b"anything"), Err(Error::NotReady)));
    let _ = client;
}

#[test]
fn registry_reuses_engine_until_goaway() {
    let registry = Arc::new(ConnectionRegistry::new());
    let key = ConnectionRegistry::connection_key("example.com", 443);

    let conn = registry.get_or_create(&key, H2Connection::client);
    let again = registry.get_or_create(&key, H2Connection::client);
    assert!(Arc::ptr_eq(&conn, &again));

    // Simulate a full handshake + GOAWAY against the registered engine.
    let mut server = H2Connection::server();
    {
        let mut client = conn.lock().unwrap();
        client.connect().unwrap();
        client.handle_connected().unwrap();
        server.attach().unwrap();
        pump(&mut client, &mut server);
        assert!(client.is_ready());

        server.close();
        let bytes = server.take_pending_send();
        client.deliver(&bytes).unwrap();

        // The owner observes GoAway and removes the registry entry.
        let saw_goaway = std::iter::from_fn(|| client.poll_event())
            .any(|e| matches!(e, H2Event::GoAway { .. }));
        assert!(saw_goaway);
    }
    registry.remove(&key);
    assert!(registry.get(&key).is_none());

    // The same registry key now yields a fresh engine.
    let fresh = registry.get_or_create(&key, H2Connection::client);
    assert!(!Arc::ptr_eq(&conn, &fresh));
}

#[test]
fn flow_control_replay_invariant() {
    use h2wire::flow_control::FlowControlWindow;

    let mut window = FlowControlWindow::new(1);
    window.init_remote_window_size(65535);

    let sends = [1usize, 100, 16384, 3, 40000];
    let updates = [1000i64, 65535, 12];
    for &n in &sends {
        window.bytes_sent(n);
    }
    for &delta in &updates {
        window.update_remote_window_size(delta);
    }

    let expected = 65535i64 - sends.iter().map(|&n| n as i64).sum::<i64>()
        + updates.iter().sum::<i64>();
    assert_eq!(window.remote_window_raw(), expected);
    assert!(window.local_window_size() as u64 <= h2wire::MAX_WINDOW_SIZE as u64);
}
