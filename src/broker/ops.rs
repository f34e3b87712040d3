//! Closed catalogue of privileged operations and their wire bodies.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BrokerError;
use crate::models::CapabilityKind;

/// Version of the operation catalogue spoken by this build.
pub const BROKER_CATALOGUE_VERSION: u32 = 2;

/// Capability-scoped opaque handle issued by the broker.
///
/// Only the issuing process may use it; the broker validates ownership on
/// every use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleToken(pub String);

impl HandleToken {
    /// Fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Display for HandleToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations a worker may ask the broker to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PrivilegedOp {
    /// Open a file for reading and return a handle bound to the requester.
    FileOpenScoped {
        /// Absolute path.
        path: PathBuf,
    },
    /// Read up to `max_bytes` from the start of a file.
    FileRead {
        /// Absolute path.
        path: PathBuf,
        /// Upper bound on returned bytes.
        max_bytes: u64,
    },
    /// Read up to `max_bytes` from an open handle's current position.
    FileReadHandle {
        /// Handle from `FileOpenScoped`.
        token: HandleToken,
        /// Upper bound on returned bytes.
        max_bytes: u64,
    },
    /// Create or replace a file with `data`.
    FileWrite {
        /// Absolute path.
        path: PathBuf,
        /// New contents.
        data: Vec<u8>,
    },
    /// Size, kind and timestamps of a file or directory.
    FileInfo {
        /// Absolute path.
        path: PathBuf,
    },
    /// Names directly under a directory.
    ListDirectory {
        /// Absolute path of the directory.
        path: PathBuf,
    },
    /// Remove a file or an empty directory.
    FileDelete {
        /// Absolute path.
        path: PathBuf,
    },
    /// Create a directory and any missing parents.
    CreateDirectory {
        /// Absolute path.
        path: PathBuf,
    },
    /// Release a handle.
    HandleClose {
        /// Handle to release.
        token: HandleToken,
    },
    /// Open an outbound TCP connection held by the broker.
    NetworkConnect {
        /// Host name or address.
        host: String,
        /// Port.
        port: u16,
    },
    /// Resolve a host name to addresses.
    DnsResolve {
        /// Host name.
        host: String,
    },
    /// Open a graphics adapter.
    GraphicsDeviceOpen {
        /// Adapter name; empty selects the default.
        #[serde(default)]
        adapter: String,
    },
    /// Read clipboard text.
    ClipboardRead,
    /// Replace clipboard text.
    ClipboardWrite {
        /// New clipboard text.
        text: String,
    },
    /// Empty the clipboard.
    ClipboardClear,
    /// Describe the host.
    SystemInfo,
}

impl PrivilegedOp {
    /// Capability the requester must hold; `None` for handle housekeeping
    /// that only needs ownership.
    #[must_use]
    pub fn required_capability(&self) -> Option<CapabilityKind> {
        match self {
            Self::FileOpenScoped { .. }
            | Self::FileRead { .. }
            | Self::FileReadHandle { .. }
            | Self::FileInfo { .. }
            | Self::ListDirectory { .. } => Some(CapabilityKind::FileRead),
            Self::FileWrite { .. } | Self::FileDelete { .. } | Self::CreateDirectory { .. } => {
                Some(CapabilityKind::FileWrite)
            }
            Self::HandleClose { .. } => None,
            Self::NetworkConnect { .. } | Self::DnsResolve { .. } => {
                Some(CapabilityKind::NetworkConnect)
            }
            Self::GraphicsDeviceOpen { .. } => Some(CapabilityKind::GraphicsDeviceAccess),
            Self::ClipboardRead => Some(CapabilityKind::ClipboardRead),
            Self::ClipboardWrite { .. } | Self::ClipboardClear => {
                Some(CapabilityKind::ClipboardWrite)
            }
            Self::SystemInfo => Some(CapabilityKind::SystemInfo),
        }
    }

    /// Operation name used in logs and audit entries.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FileOpenScoped { .. } => "file_open_scoped",
            Self::FileRead { .. } => "file_read",
            Self::FileReadHandle { .. } => "file_read_handle",
            Self::FileWrite { .. } => "file_write",
            Self::FileInfo { .. } => "file_info",
            Self::ListDirectory { .. } => "list_directory",
            Self::FileDelete { .. } => "file_delete",
            Self::CreateDirectory { .. } => "create_directory",
            Self::HandleClose { .. } => "handle_close",
            Self::NetworkConnect { .. } => "network_connect",
            Self::DnsResolve { .. } => "dns_resolve",
            Self::GraphicsDeviceOpen { .. } => "graphics_device_open",
            Self::ClipboardRead => "clipboard_read",
            Self::ClipboardWrite { .. } => "clipboard_write",
            Self::ClipboardClear => "clipboard_clear",
            Self::SystemInfo => "system_info",
        }
    }
}

/// Host description returned by `SystemInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Operating system family.
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// Available parallelism.
    pub cpus: usize,
}

/// One name returned by `ListDirectory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name within the directory.
    pub name: String,
    /// Whether the entry is itself a directory.
    pub is_dir: bool,
}

/// Successful outcome of a privileged operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum OpResult {
    /// A handle was issued.
    Handle {
        /// The new handle.
        token: HandleToken,
    },
    /// Bytes read.
    Data {
        /// Contents.
        bytes: Vec<u8>,
        /// Whether the source had more bytes than were returned.
        #[serde(default)]
        truncated: bool,
    },
    /// Bytes written.
    Written {
        /// Number of bytes written.
        bytes: u64,
    },
    /// Metadata of a path.
    FileInfo {
        /// Length in bytes.
        size: u64,
        /// Whether the path is a directory.
        is_dir: bool,
        /// Whether the path is read-only.
        readonly: bool,
        /// Last modification, where the platform reports one.
        #[serde(default)]
        modified: Option<DateTime<Utc>>,
    },
    /// Directory listing, sorted by name.
    Entries {
        /// The entries.
        entries: Vec<DirEntry>,
    },
    /// Resolved addresses.
    Addresses {
        /// Addresses in resolver order, without duplicates.
        addresses: Vec<String>,
    },
    /// A connection is held by the broker under `token`.
    Connected {
        /// Handle for the connection.
        token: HandleToken,
        /// Resolved peer address.
        peer: String,
    },
    /// A graphics device is held by the broker under `token`.
    DeviceOpened {
        /// Handle for the device.
        token: HandleToken,
        /// Adapter description.
        adapter: String,
    },
    /// Clipboard text.
    Text {
        /// Contents.
        text: String,
    },
    /// Host description.
    SystemInfo(SystemInfo),
    /// Operation completed without a value.
    Done,
}

/// JSON body of a `BrokerRequest` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRequestBody {
    /// The operation.
    pub op: PrivilegedOp,
    /// Catalogue version the requester was built with. Absent in version 1
    /// payloads.
    #[serde(default = "first_catalogue")]
    pub catalogue: u32,
}

fn first_catalogue() -> u32 {
    1
}

impl BrokerRequestBody {
    /// Body for `op` at the current catalogue version.
    #[must_use]
    pub fn new(op: PrivilegedOp) -> Self {
        Self {
            op,
            catalogue: BROKER_CATALOGUE_VERSION,
        }
    }
}

/// JSON body of a `BrokerResponse` message (after the reply prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerResponseBody {
    /// Outcome of the operation.
    pub outcome: Result<OpResult, BrokerError>,
    /// Catalogue version of the broker. Absent in version 1 payloads.
    #[serde(default = "first_catalogue")]
    pub catalogue: u32,
}
