//! Message envelope encoding and the schema registry.
//!
//! [`encode`] turns a [`Message`] into a frame body; a [`SchemaRegistry`]
//! turns frame bodies back into messages, enforcing per-kind version
//! windows. Structured payloads (broker operations, handshake) are JSON.

pub mod envelope;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::models::{Message, MessageKind, ProcessId, RouteTarget};

pub use envelope::{decode_header, encode, RawHeader, HEADER_LEN};
pub use registry::{SchemaRegistry, VersionWindow};

/// Payload of the `Hello` frame that opens every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// One-time launch token handed to the worker at spawn.
    pub token: String,
    /// Schema versions the worker was built with; informational.
    #[serde(default)]
    pub build: Option<String>,
}

/// Build the `Hello` message a worker sends first.
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] if the payload cannot be serialized.
pub fn hello(sender: ProcessId, token: &str) -> Result<Message, SchemaError> {
    let payload = HelloPayload {
        token: token.to_owned(),
        build: Some(env!("CARGO_PKG_VERSION").to_owned()),
    };
    let body = serde_json::to_vec(&payload)
        .map_err(|err| SchemaError::Malformed(format!("hello payload: {err}")))?;
    Ok(Message::new(
        sender,
        RouteTarget::Process(ProcessId::COORDINATOR),
        MessageKind::Hello,
        0,
        body,
    ))
}

/// Extract the handshake payload from a decoded `Hello` message.
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] if the message is not a `Hello` or its
/// payload is not a valid handshake body.
pub fn parse_hello(message: &Message) -> Result<HelloPayload, SchemaError> {
    if message.kind() != MessageKind::Hello {
        return Err(SchemaError::Malformed(format!(
            "expected hello, got {}",
            message.kind()
        )));
    }
    serde_json::from_slice(message.payload())
        .map_err(|err| SchemaError::Malformed(format!("hello payload: {err}")))
}

/// Body of `ProcessLost` and `RequestTimeout` notifications: the process a
/// request could not reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeliveredPayload {
    /// Process the request was addressed to.
    pub process: ProcessId,
}

/// Build a coordinator notification telling `requester` that its request
/// `in_reply_to` will never be answered by `process`.
///
/// `kind` must be `ProcessLost` or `RequestTimeout`.
#[must_use]
pub fn undelivered(
    kind: MessageKind,
    requester: ProcessId,
    sequence: u64,
    in_reply_to: u64,
    process: ProcessId,
) -> Message {
    let body = serde_json::to_vec(&UndeliveredPayload { process }).unwrap_or_default();
    Message::reply(
        ProcessId::COORDINATOR,
        RouteTarget::Process(requester),
        kind,
        sequence,
        in_reply_to,
        &body,
    )
}

/// Extract the unreachable process from a `ProcessLost` or `RequestTimeout`.
///
/// # Errors
///
/// Returns [`SchemaError::Malformed`] if the body is not a notification.
pub fn parse_undelivered(message: &Message) -> Result<UndeliveredPayload, SchemaError> {
    serde_json::from_slice(&message.body())
        .map_err(|err| SchemaError::Malformed(format!("undelivered payload: {err}")))
}
