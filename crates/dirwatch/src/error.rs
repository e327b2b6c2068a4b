//! Error types for the dirwatch crate.
//!
//! This module provides the [`WatchError`] type for errors that can occur
//! while registering, unregistering, or closing watches.

use std::io;

use dirwatch_core::{ConfigError, PathError, WatchPath};

/// Errors that can occur during watch operations.
///
/// Every registration failure is reported synchronously to the caller that
/// asked for the watch; nothing is ever raised on the notification thread.
///
/// # Error Recovery Strategy
///
/// - **Per-path errors** ([`NotWatchable`], [`NoSuchEntry`], [`NotDirectory`],
///   [`PermissionDenied`], [`WatchLimit`], [`InvalidPath`]): recoverable. The
///   service is unaffected; the caller should fall back to polling the path or
///   accept stale contents.
/// - **Service errors** ([`Closed`], [`UnsupportedOperation`], [`Config`],
///   [`Source`], [`Notify`], [`Io`]): fatal for the operation that produced
///   them.
///
/// No error is retried by this crate.
///
/// [`NotWatchable`]: WatchError::NotWatchable
/// [`NoSuchEntry`]: WatchError::NoSuchEntry
/// [`NotDirectory`]: WatchError::NotDirectory
/// [`PermissionDenied`]: WatchError::PermissionDenied
/// [`WatchLimit`]: WatchError::WatchLimit
/// [`InvalidPath`]: WatchError::InvalidPath
/// [`Closed`]: WatchError::Closed
/// [`UnsupportedOperation`]: WatchError::UnsupportedOperation
/// [`Config`]: WatchError::Config
/// [`Source`]: WatchError::Source
/// [`Notify`]: WatchError::Notify
/// [`Io`]: WatchError::Io
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The path lies under an ignored pseudo-filesystem root.
    #[error("path is not watchable: {0}")]
    NotWatchable(WatchPath),

    /// The path does not exist.
    #[error("no such file or directory: {0}")]
    NoSuchEntry(WatchPath),

    /// The path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotDirectory(WatchPath),

    /// The path could not be inspected or the native watch refused to arm.
    #[error("permission denied: {0}")]
    PermissionDenied(WatchPath),

    /// The kernel's per-user watch quota is exhausted.
    #[error("watch limit reached while watching {0}")]
    WatchLimit(WatchPath),

    /// The operation is not supported on this instance.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The service has been closed.
    #[error("watch service is closed")]
    Closed,

    /// A path could not be parsed or joined.
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The native watch source could not be started.
    #[error("failed to start watch source: {0}")]
    Source(#[source] io::Error),

    /// The portable `notify` backend failed.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// Any other I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path being operated on.
        path: WatchPath,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Raised by `inotify_add_watch` once the per-user watch quota is used up.
#[cfg(unix)]
const ENOSPC: i32 = 28;

/// Raised by `inotify_init` once the per-user instance quota is used up.
#[cfg(unix)]
const EMFILE: i32 = 24;

impl WatchError {
    /// Classifies an I/O error raised while operating on `path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::io;
    /// use dirwatch::WatchError;
    /// use dirwatch_core::WatchPath;
    ///
    /// let path = WatchPath::new("/missing").unwrap();
    /// let err = WatchError::from_io(&path, io::Error::from(io::ErrorKind::NotFound));
    /// assert!(matches!(err, WatchError::NoSuchEntry(_)));
    /// ```
    #[must_use]
    pub fn from_io(path: &WatchPath, source: io::Error) -> Self {
        #[cfg(unix)]
        if matches!(source.raw_os_error(), Some(ENOSPC | EMFILE)) {
            return Self::WatchLimit(path.clone());
        }
        match source.kind() {
            io::ErrorKind::NotFound => Self::NoSuchEntry(path.clone()),
            io::ErrorKind::NotADirectory => Self::NotDirectory(path.clone()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.clone()),
            // inotify_add_watch reports an exhausted quota as ENOSPC.
            io::ErrorKind::StorageFull => Self::WatchLimit(path.clone()),
            _ => Self::Io {
                path: path.clone(),
                source,
            },
        }
    }

    /// Classifies an error raised by the `notify` backend for `path`.
    #[must_use]
    pub fn from_notify(path: &WatchPath, err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::Io(source) => Self::from_io(path, source),
            notify::ErrorKind::PathNotFound => Self::NoSuchEntry(path.clone()),
            notify::ErrorKind::MaxFilesWatch => Self::WatchLimit(path.clone()),
            kind => Self::Notify(notify::Error::new(kind)),
        }
    }

    /// Returns `true` if the error concerns a single path and the service
    /// remains usable.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotWatchable(_)
                | Self::NoSuchEntry(_)
                | Self::NotDirectory(_)
                | Self::PermissionDenied(_)
                | Self::WatchLimit(_)
                | Self::InvalidPath(_)
        )
    }

    /// Returns `true` if the error is not recoverable.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&WatchPath> {
        match self {
            Self::NotWatchable(path)
            | Self::NoSuchEntry(path)
            | Self::NotDirectory(path)
            | Self::PermissionDenied(path)
            | Self::WatchLimit(path)
            | Self::Io { path, .. } => Some(path),
            Self::UnsupportedOperation(_)
            | Self::Closed
            | Self::InvalidPath(_)
            | Self::Config(_)
            | Self::Source(_)
            | Self::Notify(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> WatchPath {
        WatchPath::new("/storage/emulated/0").unwrap()
    }

    #[test]
    fn test_from_io_classification() {
        let cases = [
            (io::ErrorKind::NotFound, "no such file"),
            (io::ErrorKind::NotADirectory, "not a directory"),
            (io::ErrorKind::PermissionDenied, "permission denied"),
            (io::ErrorKind::StorageFull, "watch limit"),
            (io::ErrorKind::Interrupted, "I/O error"),
        ];
        for (kind, text) in cases {
            let err = WatchError::from_io(&path(), io::Error::from(kind));
            assert!(err.to_string().contains(text), "{kind:?} -> {err}");
            assert_eq!(err.path(), Some(&path()));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_from_io_quota_codes() {
        for code in [ENOSPC, EMFILE] {
            let err = WatchError::from_io(&path(), io::Error::from_raw_os_error(code));
            assert!(matches!(err, WatchError::WatchLimit(_)), "errno {code} -> {err}");
        }
        let err = WatchError::from_io(&path(), io::Error::from_raw_os_error(5));
        assert!(matches!(err, WatchError::Io { .. }));
    }

    #[test]
    fn test_from_notify_classification() {
        let err = WatchError::from_notify(&path(), notify::Error::path_not_found());
        assert!(matches!(err, WatchError::NoSuchEntry(_)));

        let err = WatchError::from_notify(
            &path(),
            notify::Error::io(io::Error::from(io::ErrorKind::PermissionDenied)),
        );
        assert!(matches!(err, WatchError::PermissionDenied(_)));

        let err = WatchError::from_notify(&path(), notify::Error::generic("backend gone"));
        assert!(matches!(err, WatchError::Notify(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(WatchError::NotWatchable(path()).is_recoverable());
        assert!(WatchError::WatchLimit(path()).is_recoverable());
        assert!(WatchError::Closed.is_fatal());
        assert!(WatchError::UnsupportedOperation("close").is_fatal());
        assert!(WatchError::Closed.path().is_none());
    }

    #[test]
    fn test_display() {
        let err = WatchError::NotWatchable(WatchPath::new("/proc/self").unwrap());
        assert_eq!(err.to_string(), "path is not watchable: /proc/self");
    }
}
