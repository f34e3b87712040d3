//! Handles issued by the broker, each bound to the process that asked for it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::File;
use tokio::net::TcpStream;

use crate::broker::ops::HandleToken;
use crate::errors::BrokerError;
use crate::models::{CapabilityKind, ProcessId};

/// Resource kept alive behind a token.
#[derive(Debug, Clone)]
pub enum HandleResource {
    /// An open file, shared so reads do not hold the table lock.
    File {
        /// Resolved path the file was opened from.
        path: PathBuf,
        /// The open file.
        file: Arc<tokio::sync::Mutex<File>>,
    },
    /// An outbound connection.
    Socket(Arc<TcpStream>),
    /// An opened graphics adapter.
    Device(String),
}

impl HandleResource {
    /// Capability a caller needs to use the resource.
    #[must_use]
    pub fn capability(&self) -> CapabilityKind {
        match self {
            Self::File { .. } => CapabilityKind::FileRead,
            Self::Socket(_) => CapabilityKind::NetworkConnect,
            Self::Device(_) => CapabilityKind::GraphicsDeviceAccess,
        }
    }
}

#[derive(Debug)]
struct Handle {
    owner: ProcessId,
    resource: HandleResource,
}

/// Table of live handles.
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: Mutex<HashMap<HandleToken, Handle>>,
}

impl HandleTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `resource` for `owner` and return its token.
    pub fn issue(&self, owner: ProcessId, resource: HandleResource) -> HandleToken {
        let token = HandleToken::generate();
        self.lock().insert(token.clone(), Handle { owner, resource });
        token
    }

    /// Look up a handle on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidHandle`] for unknown tokens;
    /// [`BrokerError::PermissionDenied`] when `requester` is not the owner.
    pub fn resolve(
        &self,
        requester: ProcessId,
        token: &HandleToken,
    ) -> Result<HandleResource, BrokerError> {
        let handles = self.lock();
        let handle = handles.get(token).ok_or(BrokerError::InvalidHandle)?;
        if handle.owner != requester {
            return Err(BrokerError::PermissionDenied {
                requester,
                capability: handle.resource.capability(),
            });
        }
        Ok(handle.resource.clone())
    }

    /// Close a handle owned by `requester`.
    ///
    /// # Errors
    ///
    /// Same as [`HandleTable::resolve`].
    pub fn close(&self, requester: ProcessId, token: &HandleToken) -> Result<(), BrokerError> {
        let mut handles = self.lock();
        let handle = handles.get(token).ok_or(BrokerError::InvalidHandle)?;
        if handle.owner != requester {
            return Err(BrokerError::PermissionDenied {
                requester,
                capability: handle.resource.capability(),
            });
        }
        handles.remove(token);
        Ok(())
    }

    /// Drop every handle owned by `owner`. Returns how many were released.
    pub fn release_owner(&self, owner: ProcessId) -> usize {
        let mut handles = self.lock();
        let before = handles.len();
        handles.retain(|_, handle| handle.owner != owner);
        before - handles.len()
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no handles are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HandleToken, Handle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
