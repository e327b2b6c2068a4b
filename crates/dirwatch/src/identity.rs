//! Physical directory identity.
//!
//! The same directory is often reachable through several path strings: bind
//! mounts (`/sdcard`, `/storage/emulated/0`, `/storage/self/primary`),
//! symlinks, or plain aliasing. Native watches operate on inodes, so the
//! engine keys observers by [`NodeIdentity`] rather than by path.

use std::fmt;
use std::fs;

use dirwatch_core::WatchPath;
use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// The `(device, inode)` pair of a directory.
///
/// Inode numbers are only unique within one device, so both halves are
/// needed to identify a node globally. On Windows the halves are the volume
/// serial number and the file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Device the node lives on.
    pub device: u64,
    /// Inode number within that device.
    pub inode: u64,
}

impl NodeIdentity {
    /// Creates an identity from its parts.
    #[inline]
    #[must_use]
    pub const fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }

    #[cfg(unix)]
    #[allow(clippy::unnecessary_wraps)]
    fn resolve(_path: &WatchPath, metadata: &fs::Metadata) -> Result<Self, WatchError> {
        use std::os::unix::fs::MetadataExt;
        Ok(Self::new(metadata.dev(), metadata.ino()))
    }

    /// Volume serial number and file index, read through a directory handle.
    #[cfg(windows)]
    fn resolve(path: &WatchPath, _metadata: &fs::Metadata) -> Result<Self, WatchError> {
        use file_id::FileId;

        let id = file_id::get_file_id(path.as_std_path()).map_err(|err| WatchError::from_io(path, err))?;
        Ok(match id {
            FileId::Inode {
                device_id,
                inode_number,
            } => Self::new(device_id, inode_number),
            FileId::LowRes {
                volume_serial_number,
                file_index,
            } => Self::new(u64::from(volume_serial_number), file_index),
            FileId::HighRes {
                volume_serial_number,
                file_id,
            } => Self::new(volume_serial_number, fold_file_id(file_id)),
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn resolve(_path: &WatchPath, _metadata: &fs::Metadata) -> Result<Self, WatchError> {
        Err(WatchError::UnsupportedOperation(
            "directory identity is not available on this platform",
        ))
    }
}

/// NTFS file ids fit in 64 bits; wider ReFS ids are folded.
#[cfg(windows)]
#[allow(clippy::cast_possible_truncation)]
fn fold_file_id(id: u128) -> u64 {
    (id as u64) ^ ((id >> 64) as u64)
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.inode)
    }
}

/// Resolves the identity of the directory at `path`, following symlinks.
///
/// The lookup is never cached: a path string may name a different node
/// from one call to the next.
///
/// # Errors
///
/// - [`WatchError::NoSuchEntry`] if nothing exists at `path`
/// - [`WatchError::NotDirectory`] if `path` is not a directory
/// - [`WatchError::PermissionDenied`] if `path` cannot be inspected
/// - [`WatchError::UnsupportedOperation`] on platforms with neither inode
///   numbers nor file ids
pub fn identity_of(path: &WatchPath) -> Result<NodeIdentity, WatchError> {
    let metadata = fs::metadata(path.as_std_path()).map_err(|err| WatchError::from_io(path, err))?;
    if !metadata.is_dir() {
        return Err(WatchError::NotDirectory(path.clone()));
    }
    NodeIdentity::resolve(path, &metadata)
}
