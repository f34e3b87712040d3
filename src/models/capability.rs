//! Capability grants assigned to a process at spawn time.
//!
//! A [`CapabilitySet`] is produced once by the coordinator and stored in the
//! process record. Nothing after spawn can widen it; the broker only reads it.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::Path;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::models::process::ProcessRole;

/// Scope used for the coordinator's file grants.
pub const ANY_PATH_SCOPE: &str = "/**";

/// A discrete, checkable grant of access to a system resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "capability")]
pub enum Capability {
    /// Read files whose canonical path matches `scope`.
    FileRead {
        /// Glob pattern over canonical paths.
        scope: String,
    },
    /// Write files whose canonical path matches `scope`.
    FileWrite {
        /// Glob pattern over canonical paths.
        scope: String,
    },
    /// Open outbound network connections.
    NetworkConnect,
    /// Open a graphics adapter.
    GraphicsDeviceAccess,
    /// Read the system clipboard.
    ClipboardRead,
    /// Write the system clipboard.
    ClipboardWrite,
    /// Query host information.
    SystemInfo,
}

/// Capability identity without its scope; what an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// See [`Capability::FileRead`].
    FileRead,
    /// See [`Capability::FileWrite`].
    FileWrite,
    /// See [`Capability::NetworkConnect`].
    NetworkConnect,
    /// See [`Capability::GraphicsDeviceAccess`].
    GraphicsDeviceAccess,
    /// See [`Capability::ClipboardRead`].
    ClipboardRead,
    /// See [`Capability::ClipboardWrite`].
    ClipboardWrite,
    /// See [`Capability::SystemInfo`].
    SystemInfo,
}

impl Display for CapabilityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::NetworkConnect => "network_connect",
            Self::GraphicsDeviceAccess => "graphics_device_access",
            Self::ClipboardRead => "clipboard_read",
            Self::ClipboardWrite => "clipboard_write",
            Self::SystemInfo => "system_info",
        };
        f.write_str(name)
    }
}

impl Capability {
    /// The unscoped kind of this grant.
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::FileRead { .. } => CapabilityKind::FileRead,
            Self::FileWrite { .. } => CapabilityKind::FileWrite,
            Self::NetworkConnect => CapabilityKind::NetworkConnect,
            Self::GraphicsDeviceAccess => CapabilityKind::GraphicsDeviceAccess,
            Self::ClipboardRead => CapabilityKind::ClipboardRead,
            Self::ClipboardWrite => CapabilityKind::ClipboardWrite,
            Self::SystemInfo => CapabilityKind::SystemInfo,
        }
    }

    fn scope(&self) -> Option<&str> {
        match self {
            Self::FileRead { scope } | Self::FileWrite { scope } => Some(scope),
            _ => None,
        }
    }
}

/// Immutable set of grants. The empty set means "no capabilities".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// The empty grant.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Default grant for a role when the coordinator does not pass one.
    #[must_use]
    pub fn default_for(role: &ProcessRole) -> Self {
        match role {
            ProcessRole::Renderer { .. } => Self::none(),
            ProcessRole::Network => [Capability::NetworkConnect].into_iter().collect(),
            ProcessRole::Gpu => [Capability::GraphicsDeviceAccess].into_iter().collect(),
            ProcessRole::Utility { .. } => [Capability::SystemInfo].into_iter().collect(),
            ProcessRole::Coordinator => [
                Capability::FileRead {
                    scope: ANY_PATH_SCOPE.into(),
                },
                Capability::FileWrite {
                    scope: ANY_PATH_SCOPE.into(),
                },
                Capability::NetworkConnect,
                Capability::GraphicsDeviceAccess,
                Capability::ClipboardRead,
                Capability::ClipboardWrite,
                Capability::SystemInfo,
            ]
            .into_iter()
            .collect(),
        }
    }

    /// Whether no grants are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the grants in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Whether an unscoped capability of `kind` is granted.
    ///
    /// File kinds only answer `true` here when some scope is present; use
    /// [`CapabilitySet::permits_path`] for the actual path check.
    #[must_use]
    pub fn grants(&self, kind: CapabilityKind) -> bool {
        self.0.iter().any(|cap| cap.kind() == kind)
    }

    /// Whether a file capability of `kind` has a scope matching `path`.
    ///
    /// `path` must already be normalized; scopes are matched with literal
    /// separators so `*` never crosses a directory boundary.
    #[must_use]
    pub fn permits_path(&self, kind: CapabilityKind, path: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.0
            .iter()
            .filter(|cap| cap.kind() == kind)
            .filter_map(Capability::scope)
            .filter_map(|scope| Pattern::new(scope).ok())
            .any(|pattern| pattern.matches_path_with(path, options))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for CapabilitySet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for cap in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match cap.scope() {
                Some(scope) => write!(f, "{}({scope})", cap.kind())?,
                None => write!(f, "{}", cap.kind())?,
            }
        }
        Ok(())
    }
}
