//! Path validation.
//!
//! Bundle keys come from manifests we don't control, and end up joined onto
//! a storage root. Anything that could climb out of that root is rejected.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage path and returns it normalized.
///
/// `.` components and repeated or trailing separators are dropped, `..` is
/// resolved as long as it never leaves the storage root. Null bytes, Windows
/// prefixes and paths that normalize to nothing are rejected with
/// [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use haul_storage::validate_path;
///
/// assert!(validate_path("Android/cube0").is_ok());
/// assert!(validate_path("../Android/cube0").is_err());
/// assert_eq!(
///     validate_path("Android/./textures//../cube0/").unwrap(),
///     Path::new("Android/cube0")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(original.to_path_buf());
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(segment) => {
                // Null bytes survive Path::components() on Unix but truncate
                // in the underlying syscalls.
                if segment.as_encoded_bytes().contains(&0) {
                    exn::bail!(invalid());
                }
                components.push(segment);
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(invalid());
    }
    Ok(components.into_iter().collect())
}
