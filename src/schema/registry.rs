//! Per-kind schema version windows.
//!
//! A registry decides which kinds a receiver understands and which payload
//! versions it accepts for each. Builds may register a subset of kinds to
//! model peers running older or newer code.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::errors::SchemaError;
use crate::models::message::REPLY_PREFIX_LEN;
use crate::models::{Message, MessageKind};
use crate::schema::envelope::{decode_header, HEADER_LEN};

/// Inclusive range of accepted schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionWindow {
    /// Oldest accepted version.
    pub min: u32,
    /// Newest accepted (and emitted) version.
    pub max: u32,
}

impl VersionWindow {
    /// Build a window, enforcing the backward-compatibility rule.
    ///
    /// A window must keep the two versions preceding `max` decodable unless
    /// it already reaches back to version 1.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidWindow`] when `min` is zero, `min`
    /// exceeds `max`, or the window is too narrow.
    pub fn new(kind: MessageKind, min: u32, max: u32) -> Result<Self, SchemaError> {
        let covers_history = min == 1 || min.saturating_add(2) <= max;
        if min == 0 || min > max || !covers_history {
            return Err(SchemaError::InvalidWindow { kind, min, max });
        }
        Ok(Self { min, max })
    }

    /// Whether `version` falls inside the window.
    #[must_use]
    pub fn contains(self, version: u32) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

/// Kinds with payload revisions beyond version 1.
const REVISED_KINDS: &[(MessageKind, u32)] = &[
    (MessageKind::BrokerRequest, 2),
    (MessageKind::BrokerResponse, 2),
];

/// Receiver-side table of known kinds and their version windows.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    windows: HashMap<MessageKind, VersionWindow>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl SchemaRegistry {
    /// Registry knowing every kind at the versions this build speaks.
    #[must_use]
    pub fn standard() -> Self {
        let windows = MessageKind::ALL
            .into_iter()
            .map(|kind| {
                let max = REVISED_KINDS
                    .iter()
                    .find(|(revised, _)| *revised == kind)
                    .map_or(1, |(_, max)| *max);
                (kind, VersionWindow { min: 1, max })
            })
            .collect();
        Self { windows }
    }

    /// Empty registry to be filled with [`SchemaRegistry::register`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            windows: HashMap::new(),
        }
    }

    /// Add or replace the window for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidWindow`] if the window is invalid.
    pub fn register(mut self, kind: MessageKind, min: u32, max: u32) -> Result<Self, SchemaError> {
        let window = VersionWindow::new(kind, min, max)?;
        self.windows.insert(kind, window);
        Ok(self)
    }

    /// Drop `kind` from the registry, as an older peer would not know it.
    #[must_use]
    pub fn without(mut self, kind: MessageKind) -> Self {
        self.windows.remove(&kind);
        self
    }

    /// Window registered for `kind`.
    #[must_use]
    pub fn window(&self, kind: MessageKind) -> Option<VersionWindow> {
        self.windows.get(&kind).copied()
    }

    /// Version this registry emits for `kind`.
    #[must_use]
    pub fn current_version(&self, kind: MessageKind) -> Option<u32> {
        self.window(kind).map(|window| window.max)
    }

    /// Decode and validate one frame body.
    ///
    /// # Errors
    ///
    /// - [`SchemaError::Malformed`] for structural faults (see
    ///   [`decode_header`]) or a response payload missing its reply prefix.
    /// - [`SchemaError::UnknownKind`] for kinds absent from this registry.
    /// - [`SchemaError::UnsupportedVersion`] outside the kind's window.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, SchemaError> {
        let header = decode_header(frame)?;
        let (kind, window) = MessageKind::from_code(header.kind_code)
            .and_then(|kind| self.window(kind).map(|window| (kind, window)))
            .ok_or(SchemaError::UnknownKind(header.kind_code))?;
        if !window.contains(header.schema_version) {
            debug!(
                %kind,
                version = header.schema_version,
                min = window.min,
                max = window.max,
                "schema version outside window"
            );
            return Err(SchemaError::UnsupportedVersion {
                kind,
                version: header.schema_version,
                min: window.min,
                max: window.max,
            });
        }
        if kind.is_response() && (header.payload_len as usize) < REPLY_PREFIX_LEN {
            return Err(SchemaError::Malformed(format!(
                "{kind} payload lacks the {REPLY_PREFIX_LEN}-byte reply prefix"
            )));
        }

        let payload = Bytes::copy_from_slice(&frame[HEADER_LEN..]);
        Ok(Message::from_parts(
            header.sender,
            header.destination,
            header.priority,
            header.sequence,
            kind,
            header.schema_version,
            payload,
        ))
    }
}
