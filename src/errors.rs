//! Error types shared across the bus.
//!
//! Each component owns a narrow error enum; [`AppError`] aggregates them for
//! the host binary and configuration loading.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{CapabilityKind, MessageKind, PriorityClass, ProcessId, ProcessRole, RouteTarget};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Transport faults. Recoverable by respawn; never silently swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed locally or the peer went away.
    #[error("channel closed")]
    Closed,
    /// Buffered outbound bytes would exceed the per-channel cap.
    ///
    /// A backpressure signal, not a fatal error.
    #[error("channel buffer overflow: {buffered} buffered + {frame} bytes exceeds {capacity}")]
    Overflow {
        /// Bytes already waiting for the writer.
        buffered: usize,
        /// Size of the rejected frame.
        frame: usize,
        /// Configured buffer cap.
        capacity: usize,
    },
    /// A single frame exceeds the configured maximum frame length.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Underlying stream failure.
    #[error("transport i/o: {0}")]
    Io(String),
    /// Handshake did not complete as expected.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Envelope decode faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Kind code absent from the receiver's registry (version skew).
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    /// Schema version outside the kind's supported window.
    #[error("{kind} schema version {version} outside supported window {min}..={max}")]
    UnsupportedVersion {
        /// Message kind.
        kind: MessageKind,
        /// Version received.
        version: u32,
        /// Oldest supported version.
        min: u32,
        /// Newest supported version.
        max: u32,
    },
    /// Structurally invalid bytes; the sending channel is suspect.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// A registry window that breaks the backward-compatibility rule.
    #[error("invalid version window for {kind}: {min}..={max}")]
    InvalidWindow {
        /// Message kind.
        kind: MessageKind,
        /// Declared minimum.
        min: u32,
        /// Declared maximum.
        max: u32,
    },
}

/// Rejection raised when a queue cannot admit a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackpressureError {
    /// The class queue or the total channel buffer is full.
    #[error("{class} queue full (capacity {capacity})")]
    QueueFull {
        /// Class that was rejected.
        class: PriorityClass,
        /// Capacity that was hit.
        capacity: usize,
    },
}

/// Routing faults. Local to the sender.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Target is not a Ready process (or no process matches a broadcast).
    #[error("unknown destination {0}")]
    UnknownDestination(RouteTarget),
    /// Sequence not strictly greater than the last one seen on this pair.
    #[error("replayed message from {sender} to {destination}: sequence {sequence} <= {last}")]
    Replayed {
        /// Sender.
        sender: ProcessId,
        /// Destination.
        destination: RouteTarget,
        /// Offending sequence.
        sequence: u64,
        /// Last accepted sequence.
        last: u64,
    },
    /// The destination's queue rejected the message.
    #[error(transparent)]
    Backpressure(#[from] BackpressureError),
    /// The broker queue is gone (coordinator shutting down).
    #[error("broker unavailable")]
    BrokerUnavailable,
    /// The message can never be written as a single frame.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A worker attempted a coordinator-only kind.
    #[error("{sender} may not send {kind}")]
    Forbidden {
        /// Offending sender.
        sender: ProcessId,
        /// Kind it attempted.
        kind: MessageKind,
    },
}

/// Outcome of a pending request that did not produce a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The deadline expired first.
    #[error("request timed out")]
    Timeout,
    /// The target process exited before answering.
    #[error("process {0} lost")]
    ProcessLost(ProcessId),
    /// The owner cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The request could not be routed at all.
    #[error(transparent)]
    Route(#[from] RouteError),
    /// The request could not be written to the channel.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Privilege faults. Serialized into broker responses.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "error")]
pub enum BrokerError {
    /// The requester lacks the required capability.
    #[error("permission denied: {requester} lacks {capability}")]
    PermissionDenied {
        /// Requesting process.
        requester: ProcessId,
        /// Capability that was required.
        capability: CapabilityKind,
    },
    /// Unknown or closed handle token.
    #[error("invalid handle")]
    InvalidHandle,
    /// Operation arguments were rejected before execution.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// Process lifecycle faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The launcher could not start the process or establish its channel.
    #[error("launch of {role} failed: {reason}")]
    LaunchFailed {
        /// Role being launched.
        role: ProcessRole,
        /// Launcher error.
        reason: String,
    },
    /// No record for the identifier.
    #[error("unknown process {0}")]
    UnknownProcess(ProcessId),
    /// The supervisor actor has stopped.
    #[error("supervisor stopped")]
    Stopped,
}

/// Application error covering configuration, I/O, and component failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    #[error("config: {0}")]
    Config(String),
    /// File-system or I/O operation failure.
    #[error("io: {0}")]
    Io(String),
    /// Transport failure.
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),
    /// Envelope failure.
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
    /// Routing failure.
    #[error("route: {0}")]
    Route(#[from] RouteError),
    /// Broker failure.
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    /// Supervisor failure.
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),
    /// Request failure.
    #[error("request: {0}")]
    Request(#[from] RequestError),
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
