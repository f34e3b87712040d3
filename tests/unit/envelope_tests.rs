//! Unit tests for the envelope header and the schema registry.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Encode then decode a message | Every header field survives |
//! | Truncated frame | `Malformed` |
//! | Unknown destination tag / broadcast set / priority byte | `Malformed` |
//! | Payload length disagrees with frame | `Malformed` |
//! | Kind missing from the receiver registry | `UnknownKind` |
//! | Version outside the window | `UnsupportedVersion` |
//! | Response without its reply prefix | `Malformed` |
//! | Window narrower than two prior versions | `InvalidWindow` |

use bytes::{BufMut, Bytes, BytesMut};

use privsep_bus::errors::SchemaError;
use privsep_bus::models::{
    BroadcastSet, Message, MessageKind, PriorityClass, ProcessId, RouteTarget,
};
use privsep_bus::schema::{self, decode_header, encode, SchemaRegistry, VersionWindow, HEADER_LEN};

fn navigate() -> Message {
    Message::new(
        ProcessId(7),
        RouteTarget::Process(ProcessId::COORDINATOR),
        MessageKind::Navigate,
        42,
        Bytes::from_static(b"https://example.test/"),
    )
}

fn malformed(result: Result<Message, SchemaError>) -> String {
    match result {
        Err(SchemaError::Malformed(reason)) => reason,
        other => panic!("expected Malformed, got {other:?}"),
    }
}

// ── Header layout ─────────────────────────────────────────────────────────────

/// Every header field survives an encode/decode pass, including the
/// destination variant and a coordinator-chosen priority.
#[test]
fn header_fields_survive_encoding() {
    let registry = SchemaRegistry::standard();
    let cases = [
        navigate(),
        Message::new(
            ProcessId::COORDINATOR,
            RouteTarget::Broadcast(BroadcastSet::AllRenderers),
            MessageKind::Telemetry,
            3,
            Bytes::from_static(b"{}"),
        )
        .with_priority(PriorityClass::Critical),
        Message::new(
            ProcessId(9),
            RouteTarget::Broker,
            MessageKind::BrokerRequest,
            1,
            Bytes::from_static(b"{\"op\":{\"op\":\"system_info\"}}"),
        )
        .with_schema_version(2),
    ];

    for message in cases {
        let frame = encode(&message);
        assert_eq!(frame.len(), HEADER_LEN + message.payload().len());
        let decoded = registry.decode(&frame).expect("decode");
        assert_eq!(decoded, message);
    }
}

/// `decode_header` exposes the raw kind code before any registry lookup.
#[test]
fn raw_header_reports_kind_code() {
    let frame = encode(&navigate());
    let header = decode_header(&frame).expect("header");
    assert_eq!(header.kind_code, MessageKind::Navigate.code());
    assert_eq!(header.sender, ProcessId(7));
    assert_eq!(header.sequence, 42);
    assert_eq!(header.payload_len as usize, navigate().payload().len());
}

// ── Structural faults ─────────────────────────────────────────────────────────

/// A frame shorter than the fixed header is malformed.
#[test]
fn short_frame_is_malformed() {
    let registry = SchemaRegistry::standard();
    let frame = encode(&navigate());
    let reason = malformed(registry.decode(&frame[..HEADER_LEN - 1]));
    assert!(reason.contains("shorter"), "{reason}");
}

/// Byte offsets inside the header, used to corrupt individual fields.
const TAG_OFFSET: usize = 8;
const DEST_OFFSET: usize = 9;
const PRIORITY_OFFSET: usize = 17;
const LENGTH_OFFSET: usize = 34;

fn corrupt(offset: usize, bytes: &[u8]) -> Bytes {
    let mut frame = BytesMut::from(encode(&navigate()).as_ref());
    frame[offset..offset + bytes.len()].copy_from_slice(bytes);
    frame.freeze()
}

/// An unknown destination tag is malformed.
#[test]
fn unknown_destination_tag_is_malformed() {
    let registry = SchemaRegistry::standard();
    let reason = malformed(registry.decode(&corrupt(TAG_OFFSET, &[9])));
    assert!(reason.contains("destination tag"), "{reason}");
}

/// A broadcast tag naming no known set is malformed.
#[test]
fn unknown_broadcast_set_is_malformed() {
    let registry = SchemaRegistry::standard();
    let mut frame = BytesMut::from(corrupt(TAG_OFFSET, &[1]).as_ref());
    frame[DEST_OFFSET..DEST_OFFSET + 8].copy_from_slice(&77_u64.to_be_bytes());
    let reason = malformed(registry.decode(&frame));
    assert!(reason.contains("broadcast set"), "{reason}");
}

/// A priority byte outside 0..=3 is malformed.
#[test]
fn invalid_priority_is_malformed() {
    let registry = SchemaRegistry::standard();
    let reason = malformed(registry.decode(&corrupt(PRIORITY_OFFSET, &[4])));
    assert!(reason.contains("priority"), "{reason}");
}

/// A declared payload length that disagrees with the frame is malformed,
/// in either direction.
#[test]
fn length_mismatch_is_malformed() {
    let registry = SchemaRegistry::standard();
    let actual = navigate().payload().len() as u32;
    for declared in [actual + 1, actual - 1] {
        let frame = corrupt(LENGTH_OFFSET, &declared.to_be_bytes());
        malformed(registry.decode(&frame));
    }
}

// ── Registry checks ───────────────────────────────────────────────────────────

/// A kind code the receiver does not know is reported as unknown, not
/// malformed.
#[test]
fn unregistered_kind_is_unknown() {
    let older_peer = SchemaRegistry::standard().without(MessageKind::Navigate);
    let err = older_peer
        .decode(&encode(&navigate()))
        .expect_err("kind missing");
    assert_eq!(err, SchemaError::UnknownKind(MessageKind::Navigate.code()));
}

/// A code no build has ever assigned is unknown too.
#[test]
fn unassigned_code_is_unknown() {
    let registry = SchemaRegistry::standard();
    let frame = corrupt(26, &9_999_u32.to_be_bytes());
    assert_eq!(
        registry.decode(&frame).expect_err("unknown"),
        SchemaError::UnknownKind(9_999)
    );
}

/// Versions outside the window are rejected with the window in the error.
#[test]
fn version_outside_window_is_unsupported() {
    let registry = SchemaRegistry::standard();
    let newer = navigate().with_schema_version(2);
    let err = registry.decode(&encode(&newer)).expect_err("too new");
    assert_eq!(
        err,
        SchemaError::UnsupportedVersion {
            kind: MessageKind::Navigate,
            version: 2,
            min: 1,
            max: 1,
        }
    );

    let ancient = navigate().with_schema_version(0);
    assert!(matches!(
        registry.decode(&encode(&ancient)),
        Err(SchemaError::UnsupportedVersion { version: 0, .. })
    ));
}

/// Both broker catalogue versions decode under the standard registry.
#[test]
fn broker_kinds_accept_both_catalogue_versions() {
    let registry = SchemaRegistry::standard();
    assert_eq!(registry.current_version(MessageKind::BrokerRequest), Some(2));
    for version in [1, 2] {
        let message = Message::new(
            ProcessId(3),
            RouteTarget::Broker,
            MessageKind::BrokerRequest,
            1,
            Bytes::from_static(b"{}"),
        )
        .with_schema_version(version);
        registry.decode(&encode(&message)).expect("accepted");
    }
}

/// A response kind whose payload cannot hold the reply prefix is malformed.
#[test]
fn response_without_reply_prefix_is_malformed() {
    let registry = SchemaRegistry::standard();
    let pong = Message::new(
        ProcessId(4),
        RouteTarget::Process(ProcessId::COORDINATOR),
        MessageKind::Pong,
        1,
        Bytes::from_static(b"1234567"),
    );
    let reason = malformed(registry.decode(&encode(&pong)));
    assert!(reason.contains("reply prefix"), "{reason}");
}

/// Replies carry the request sequence in front of the body.
#[test]
fn reply_prefix_round_trips() {
    let registry = SchemaRegistry::standard();
    let reply = Message::reply(
        ProcessId(4),
        RouteTarget::Process(ProcessId::COORDINATOR),
        MessageKind::NavigationCommitted,
        5,
        42,
        b"committed",
    );
    let decoded = registry.decode(&encode(&reply)).expect("decode");
    assert_eq!(decoded.in_reply_to(), Some(42));
    assert_eq!(decoded.body().as_ref(), b"committed");
}

// ── Version windows ───────────────────────────────────────────────────────────

/// A window must keep the two versions before `max` unless it starts at 1.
#[test]
fn windows_keep_two_prior_versions() {
    let kind = MessageKind::DomUpdate;
    assert!(VersionWindow::new(kind, 1, 1).is_ok());
    assert!(VersionWindow::new(kind, 1, 2).is_ok());
    assert!(VersionWindow::new(kind, 3, 5).is_ok());
    assert_eq!(
        VersionWindow::new(kind, 4, 5),
        Err(SchemaError::InvalidWindow {
            kind,
            min: 4,
            max: 5
        })
    );
    assert!(VersionWindow::new(kind, 0, 3).is_err());
    assert!(VersionWindow::new(kind, 3, 2).is_err());
}

/// Registering a kind on an empty registry makes exactly that kind decodable.
#[test]
fn empty_registry_learns_registered_kinds() {
    let registry = SchemaRegistry::empty()
        .register(MessageKind::Navigate, 1, 3)
        .expect("valid window");
    assert_eq!(registry.current_version(MessageKind::Navigate), Some(3));
    assert_eq!(registry.window(MessageKind::Ping), None);
    registry
        .decode(&encode(&navigate().with_schema_version(3)))
        .expect("in window");
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// Undelivered notifications name the unreachable process.
#[test]
fn undelivered_payload_names_the_lost_process() {
    let lost = schema::undelivered(
        MessageKind::ProcessLost,
        ProcessId(5),
        1,
        17,
        ProcessId(8),
    );
    assert_eq!(lost.sender(), ProcessId::COORDINATOR);
    assert_eq!(lost.destination(), RouteTarget::Process(ProcessId(5)));
    assert_eq!(lost.in_reply_to(), Some(17));
    let payload = schema::parse_undelivered(&lost).expect("payload");
    assert_eq!(payload.process, ProcessId(8));
}

/// A hello carries the launch token.
#[test]
fn hello_carries_token() {
    let hello = schema::hello(ProcessId(3), "token-abc").expect("hello");
    let mut frame = BytesMut::new();
    frame.put_slice(&encode(&hello));
    let decoded = SchemaRegistry::standard().decode(&frame).expect("decode");
    let payload = schema::parse_hello(&decoded).expect("payload");
    assert_eq!(payload.token, "token-abc");
    assert!(schema::parse_hello(&navigate()).is_err());
}
