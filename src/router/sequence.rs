//! Per-(sender, destination) sequence tracking for replay detection.

use std::collections::HashMap;

use crate::errors::RouteError;
use crate::models::{ProcessId, RouteTarget};

/// Last accepted sequence per conversation.
///
/// A message is accepted only if its sequence is strictly greater than the
/// last one accepted on the same pair. Retry-safe kinds bypass the check
/// without moving the high-water mark backwards.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<(ProcessId, RouteTarget), u64>,
}

impl SequenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `sequence` and record it when accepted.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Replayed`] for a duplicate or out-of-order
    /// sequence on a kind that is not retry-safe.
    pub fn observe(
        &mut self,
        sender: ProcessId,
        destination: RouteTarget,
        sequence: u64,
        retry_safe: bool,
    ) -> Result<(), RouteError> {
        let key = (sender, destination);
        match self.last_seen.get(&key).copied() {
            Some(last) if sequence <= last => {
                if retry_safe {
                    Ok(())
                } else {
                    Err(RouteError::Replayed {
                        sender,
                        destination,
                        sequence,
                        last,
                    })
                }
            }
            _ => {
                self.last_seen.insert(key, sequence);
                Ok(())
            }
        }
    }

    /// Forget every conversation `id` took part in.
    pub fn forget(&mut self, id: ProcessId) {
        self.last_seen
            .retain(|(sender, destination), _| *sender != id && *destination != RouteTarget::Process(id));
    }

    /// Number of tracked conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
