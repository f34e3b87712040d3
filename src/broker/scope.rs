//! Path normalization and scope checks for file operations.
//!
//! A request path is normalized lexically first, then resolved through the
//! file system so a symlink inside a granted scope cannot point outside it.
//! Both the lexical and the resolved path must match a granted scope.

use std::path::{Component, Path, PathBuf};

use crate::errors::BrokerError;
use crate::models::{CapabilityKind, CapabilitySet, ProcessId};

/// Lexically normalize an absolute path, folding `.` and `..` segments.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidRequest`] if the path is relative or a
/// `..` segment would climb above the root.
pub fn normalize(candidate: &Path) -> Result<PathBuf, BrokerError> {
    if !candidate.is_absolute() {
        return Err(BrokerError::InvalidRequest(format!(
            "path must be absolute: {}",
            candidate.display()
        )));
    }

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() || normalized.as_os_str().is_empty() {
                    return Err(BrokerError::InvalidRequest(
                        "path climbs above the root".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => normalized.push(component),
            Component::Normal(part) => normalized.push(part),
        }
    }
    Ok(normalized)
}

/// Resolve symlinks in `path`.
///
/// Existing paths are canonicalized whole. For a path that does not exist
/// yet (a file about to be written), the parent is canonicalized and the
/// file name re-attached.
fn resolve(path: &Path) -> Result<PathBuf, BrokerError> {
    if path.exists() {
        return path
            .canonicalize()
            .map_err(|err| BrokerError::OperationFailed(format!("cannot resolve path: {err}")));
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if parent.exists() => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .map_err(|err| BrokerError::OperationFailed(format!("cannot resolve path: {err}"))),
        _ => Ok(path.to_path_buf()),
    }
}

/// Check `candidate` against the `kind` scopes in `capabilities`.
///
/// Returns the resolved path the operation must act on.
///
/// # Errors
///
/// - [`BrokerError::InvalidRequest`] for relative or escaping paths.
/// - [`BrokerError::PermissionDenied`] when no scope matches the lexical
///   path, or a symlink resolves outside every scope.
pub fn authorize_path(
    capabilities: &CapabilitySet,
    kind: CapabilityKind,
    requester: ProcessId,
    candidate: &Path,
) -> Result<PathBuf, BrokerError> {
    let denied = BrokerError::PermissionDenied {
        requester,
        capability: kind,
    };

    let normalized = normalize(candidate)?;
    if !capabilities.permits_path(kind, &normalized) {
        return Err(denied);
    }

    let resolved = resolve(&normalized)?;
    if resolved != normalized && !capabilities.permits_path(kind, &resolved) {
        tracing::warn!(
            %requester,
            requested = %normalized.display(),
            resolved = %resolved.display(),
            "symlink target escapes granted scope"
        );
        return Err(denied);
    }
    Ok(resolved)
}
