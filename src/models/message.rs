//! Message envelope model and the closed catalogue of message kinds.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::models::process::ProcessId;

/// Length of the `in_reply_to` prefix carried by response-shaped payloads.
pub const REPLY_PREFIX_LEN: usize = 8;

/// Ordered priority class. `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Bulk traffic (frames, resources, telemetry).
    Low = 0,
    /// Ordinary content traffic.
    Normal = 1,
    /// Latency-sensitive control traffic.
    High = 2,
    /// Input and security events; never starved.
    Critical = 3,
}

impl PriorityClass {
    /// All classes, highest first.
    pub const DESCENDING: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Wire representation.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Dense index usable for per-class arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Display for PriorityClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Named group of processes a broadcast fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastSet {
    /// Every Ready renderer.
    AllRenderers,
    /// Every Ready worker regardless of role.
    AllWorkers,
}

impl BroadcastSet {
    /// Wire identifier carried in the destination id field.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self {
            Self::AllRenderers => 0,
            Self::AllWorkers => 1,
        }
    }

    /// Parse the wire identifier.
    #[must_use]
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::AllRenderers),
            1 => Some(Self::AllWorkers),
            _ => None,
        }
    }
}

/// Where a message is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// A single process.
    Process(ProcessId),
    /// Every Ready member of a broadcast set.
    Broadcast(BroadcastSet),
    /// The privilege broker inside the coordinator.
    Broker,
}

impl Display for RouteTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process(id) => write!(f, "{id}"),
            Self::Broadcast(BroadcastSet::AllRenderers) => f.write_str("broadcast:renderers"),
            Self::Broadcast(BroadcastSet::AllWorkers) => f.write_str("broadcast:workers"),
            Self::Broker => f.write_str("broker"),
        }
    }
}

/// Closed catalogue of message kinds. The discriminant is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// First frame on a fresh channel; carries the launch token.
    Hello = 1,
    /// Liveness check.
    Ping = 2,
    /// Liveness answer.
    Pong = 3,
    /// Asks a worker to drain and exit.
    Shutdown = 4,
    /// A request could not complete because its target went away.
    ProcessLost = 5,
    /// A queued request expired before dispatch.
    RequestTimeout = 6,
    /// User input destined for a renderer.
    InputEvent = 10,
    /// Security-relevant notification.
    SecurityEvent = 11,
    /// Navigation request to a renderer.
    Navigate = 20,
    /// Navigation answer.
    NavigationCommitted = 21,
    /// Incremental document update.
    DomUpdate = 30,
    /// Result of script evaluation.
    ScriptResult = 31,
    /// Fetch issued to the network process.
    NetworkRequest = 32,
    /// Fetch answer.
    NetworkResponse = 33,
    /// Compositor frame.
    FrameData = 40,
    /// Resource body chunk.
    ResourceData = 41,
    /// Metrics sample.
    Telemetry = 42,
    /// Privileged operation request for the broker.
    BrokerRequest = 50,
    /// Broker answer.
    BrokerResponse = 51,
}

impl MessageKind {
    /// Every kind in the catalogue.
    pub const ALL: [Self; 19] = [
        Self::Hello,
        Self::Ping,
        Self::Pong,
        Self::Shutdown,
        Self::ProcessLost,
        Self::RequestTimeout,
        Self::InputEvent,
        Self::SecurityEvent,
        Self::Navigate,
        Self::NavigationCommitted,
        Self::DomUpdate,
        Self::ScriptResult,
        Self::NetworkRequest,
        Self::NetworkResponse,
        Self::FrameData,
        Self::ResourceData,
        Self::Telemetry,
        Self::BrokerRequest,
        Self::BrokerResponse,
    ];

    /// Wire code.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a kind by wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Look up a kind by its `snake_case` name, as used in configuration.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// `snake_case` name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Shutdown => "shutdown",
            Self::ProcessLost => "process_lost",
            Self::RequestTimeout => "request_timeout",
            Self::InputEvent => "input_event",
            Self::SecurityEvent => "security_event",
            Self::Navigate => "navigate",
            Self::NavigationCommitted => "navigation_committed",
            Self::DomUpdate => "dom_update",
            Self::ScriptResult => "script_result",
            Self::NetworkRequest => "network_request",
            Self::NetworkResponse => "network_response",
            Self::FrameData => "frame_data",
            Self::ResourceData => "resource_data",
            Self::Telemetry => "telemetry",
            Self::BrokerRequest => "broker_request",
            Self::BrokerResponse => "broker_response",
        }
    }

    /// Default priority class; only the coordinator may override it.
    #[must_use]
    pub fn default_priority(self) -> PriorityClass {
        match self {
            Self::Hello
            | Self::Shutdown
            | Self::ProcessLost
            | Self::RequestTimeout
            | Self::InputEvent
            | Self::SecurityEvent => PriorityClass::Critical,
            Self::Ping
            | Self::Pong
            | Self::Navigate
            | Self::NavigationCommitted
            | Self::BrokerRequest
            | Self::BrokerResponse => PriorityClass::High,
            Self::DomUpdate | Self::ScriptResult | Self::NetworkRequest | Self::NetworkResponse => {
                PriorityClass::Normal
            }
            Self::FrameData | Self::ResourceData | Self::Telemetry => PriorityClass::Low,
        }
    }

    /// Time a message of this kind may sit in a queue before it is stale.
    ///
    /// `None` means the kind never expires.
    #[must_use]
    pub fn default_ttl(self) -> Option<Duration> {
        match self {
            Self::Hello
            | Self::Shutdown
            | Self::ProcessLost
            | Self::RequestTimeout
            | Self::InputEvent
            | Self::SecurityEvent => None,
            Self::Ping | Self::Pong | Self::DomUpdate => Some(Duration::from_secs(5)),
            Self::ScriptResult | Self::BrokerRequest | Self::BrokerResponse => {
                Some(Duration::from_secs(10))
            }
            Self::Navigate
            | Self::NavigationCommitted
            | Self::NetworkRequest
            | Self::NetworkResponse
            | Self::ResourceData => Some(Duration::from_secs(30)),
            Self::FrameData => Some(Duration::from_millis(500)),
            Self::Telemetry => Some(Duration::from_secs(60)),
        }
    }

    /// Whether the kind expects a response and gets a pending entry.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Navigate | Self::NetworkRequest | Self::BrokerRequest
        )
    }

    /// Whether the payload begins with an `in_reply_to` sequence.
    #[must_use]
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::Pong
                | Self::ProcessLost
                | Self::RequestTimeout
                | Self::NavigationCommitted
                | Self::ScriptResult
                | Self::NetworkResponse
                | Self::BrokerResponse
        )
    }

    /// Whether duplicates and out-of-order copies may be delivered.
    #[must_use]
    pub fn is_retry_safe(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Telemetry)
    }

    /// Whether the kind belongs to the privileged-operation set.
    #[must_use]
    pub fn is_privileged(self) -> bool {
        matches!(self, Self::BrokerRequest | Self::BrokerResponse)
    }

    /// Whether only the coordinator may originate this kind.
    #[must_use]
    pub fn is_coordinator_only(self) -> bool {
        matches!(
            self,
            Self::Shutdown | Self::ProcessLost | Self::RequestTimeout | Self::BrokerResponse
        )
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable envelope. Fields are fixed at construction; a retry is a new
/// message with a new sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: ProcessId,
    destination: RouteTarget,
    priority: PriorityClass,
    sequence: u64,
    kind: MessageKind,
    schema_version: u32,
    payload: Bytes,
}

impl Message {
    /// Build a message with the kind's default priority and schema version 1.
    #[must_use]
    pub fn new(
        sender: ProcessId,
        destination: RouteTarget,
        kind: MessageKind,
        sequence: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sender,
            destination,
            priority: kind.default_priority(),
            sequence,
            kind,
            schema_version: 1,
            payload: payload.into(),
        }
    }

    /// Build a response-shaped message whose payload is prefixed with
    /// `in_reply_to`.
    #[must_use]
    pub fn reply(
        sender: ProcessId,
        destination: RouteTarget,
        kind: MessageKind,
        sequence: u64,
        in_reply_to: u64,
        body: &[u8],
    ) -> Self {
        let mut payload = BytesMut::with_capacity(REPLY_PREFIX_LEN + body.len());
        payload.put_u64(in_reply_to);
        payload.put_slice(body);
        Self::new(sender, destination, kind, sequence, payload.freeze())
    }

    /// Assemble a message from already-validated header fields.
    #[must_use]
    pub(crate) fn from_parts(
        sender: ProcessId,
        destination: RouteTarget,
        priority: PriorityClass,
        sequence: u64,
        kind: MessageKind,
        schema_version: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            sender,
            destination,
            priority,
            sequence,
            kind,
            schema_version,
            payload,
        }
    }

    /// Same message with a different declared priority.
    #[must_use]
    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    /// Same message with a different schema version.
    #[must_use]
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Same message addressed elsewhere; used when fanning out broadcasts.
    #[must_use]
    pub(crate) fn readdressed(&self, destination: RouteTarget) -> Self {
        Self {
            destination,
            ..self.clone()
        }
    }

    /// Originating process.
    #[must_use]
    pub fn sender(&self) -> ProcessId {
        self.sender
    }

    /// Destination.
    #[must_use]
    pub fn destination(&self) -> RouteTarget {
        self.destination
    }

    /// Declared or classified priority.
    #[must_use]
    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    /// Per-(sender, destination) sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Wire schema version of the payload.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Raw payload, including any `in_reply_to` prefix.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Sequence of the request this message answers, for response kinds.
    #[must_use]
    pub fn in_reply_to(&self) -> Option<u64> {
        if !self.kind.is_response() {
            return None;
        }
        let prefix: [u8; REPLY_PREFIX_LEN] = self.payload.get(..REPLY_PREFIX_LEN)?.try_into().ok()?;
        Some(u64::from_be_bytes(prefix))
    }

    /// Payload without the `in_reply_to` prefix.
    #[must_use]
    pub fn body(&self) -> Bytes {
        if self.kind.is_response() && self.payload.len() >= REPLY_PREFIX_LEN {
            self.payload.slice(REPLY_PREFIX_LEN..)
        } else {
            self.payload.clone()
        }
    }
}
