//! Native watch sources.
//!
//! A [`WatchSource`] arms and disarms single-directory, non-recursive native
//! watches and pushes what they report into an unbounded channel as
//! [`SourceEvent`]s. Sources never touch the registry: the router thread in
//! [`crate::dispatcher`] consumes the channel and does all bookkeeping, so a
//! source callback can never deadlock against a caller holding the registry
//! lock.
//!
//! Two backends exist:
//!
//! | Backend | Platforms | Self events | Duplicates |
//! |---------|-----------|-------------|------------|
//! | [`inotify`](self::inotify) | Linux, Android | exact, via watch descriptor | none |
//! | [`notify`](self::notify) | everywhere | inferred from paths | possible on aliases |

use std::sync::Arc;

use dirwatch_core::{Backend, WatchConfig, WatchPath};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::events::EventKind;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;
pub mod notify;

/// Identifies one armed native watch.
///
/// Ids are allocated by the registry and never reused within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Creates an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a native watch reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    /// An immediate entry of the watched directory changed.
    Child {
        /// The kind of change.
        kind: EventKind,
        /// The entry's file name.
        name: String,
        /// Whether the entry is a directory.
        is_dir: bool,
    },
    /// The watched directory's own attributes changed.
    SelfModified,
    /// The watched directory was deleted.
    SelfDeleted,
    /// The watched directory was renamed.
    SelfMoved,
    /// The kernel dropped the watch (deletion, unmount, or removal).
    Stopped,
}

/// A change attributed to one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The observer that reported the change.
    pub observer: ObserverId,
    /// The change itself.
    pub change: RawChange,
}

impl RawEvent {
    /// Creates a child-entry event.
    #[must_use]
    pub fn child(observer: ObserverId, kind: EventKind, name: impl Into<String>, is_dir: bool) -> Self {
        Self {
            observer,
            change: RawChange::Child {
                kind,
                name: name.into(),
                is_dir,
            },
        }
    }
}

/// Everything a source can push to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A change reported by one observer.
    Raw(RawEvent),
    /// The native queue overflowed and events were lost.
    Overflow,
}

impl From<RawEvent> for SourceEvent {
    fn from(event: RawEvent) -> Self {
        Self::Raw(event)
    }
}

/// Sending half of the source channel.
pub type EventSink = mpsc::UnboundedSender<SourceEvent>;

/// Receiving half of the source channel.
pub type EventStream = mpsc::UnboundedReceiver<SourceEvent>;

/// A native watch primitive.
///
/// Implementations must be cheap to call while the registry write lock is
/// held and must never call back into the registry.
pub trait WatchSource: Send + Sync {
    /// Arms a non-recursive watch on `path`, reporting as `id`.
    ///
    /// # Errors
    ///
    /// Returns the classified native error: [`WatchError::NoSuchEntry`],
    /// [`WatchError::NotDirectory`], [`WatchError::PermissionDenied`],
    /// [`WatchError::WatchLimit`], or [`WatchError::Io`].
    fn add(&self, id: ObserverId, path: &WatchPath) -> Result<(), WatchError>;

    /// Disarms the watch reporting as `id`. Unknown ids are ignored.
    fn remove(&self, id: ObserverId);

    /// Stops delivering events and releases the native handle.
    ///
    /// After shutdown every [`EventSink`] clone held by the source is
    /// dropped, which ends the router.
    fn shutdown(&self);

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Opens the source selected by `config`.
///
/// # Errors
///
/// Returns [`WatchError::Source`] or [`WatchError::Notify`] if the native
/// handle cannot be created, and [`WatchError::UnsupportedOperation`] when
/// inotify is requested on a platform without it.
pub fn open(config: &WatchConfig, sink: EventSink) -> Result<Arc<dyn WatchSource>, WatchError> {
    let backend = config.backend.resolve();
    tracing::debug!(?backend, "Opening watch source");
    match backend {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Backend::Inotify => Ok(Arc::new(inotify::InotifySource::open(
            config.event_buffer_size,
            sink,
        )?)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        Backend::Inotify => Err(WatchError::UnsupportedOperation(
            "the inotify backend is only available on Linux and Android",
        )),
        _ => Ok(Arc::new(notify::NotifySource::open(sink)?)),
    }
}
