//! Event and listener types.
//!
//! A [`Listener`] receives `(EventKind, WatchPath)` pairs for the immediate
//! entries of the directories it is registered on. Listeners are shared as
//! [`ListenerHandle`]s, which compare by identity: unregistering requires the
//! same handle (or a clone of it) that was registered.
//!
//! # Event Flow
//!
//! ```text
//! filesystem mutation
//!        │
//!        ▼
//!   Observer (raw event, notification thread)
//!        │
//!        ▼
//!   WatchRegistry (bookkeeping, routing)
//!        │
//!        ▼
//!   EventDispatcher (delivery thread) ──► Listener::on_event
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dirwatch_core::WatchPath;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The kind of change reported for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An entry was created.
    Created,
    /// An entry was deleted.
    Deleted,
    /// An entry was renamed into the directory.
    MovedIn,
    /// An entry was renamed out of the directory.
    MovedOut,
    /// An entry's contents or attributes changed.
    Modified,
}

impl EventKind {
    /// Returns `true` for kinds that change the set of entries in a
    /// directory, as opposed to [`EventKind::Modified`].
    #[inline]
    #[must_use]
    pub const fn is_structural(self) -> bool {
        !matches!(self, Self::Modified)
    }

    /// Returns `true` if the entry now exists.
    #[inline]
    #[must_use]
    pub const fn is_addition(self) -> bool {
        matches!(self, Self::Created | Self::MovedIn)
    }

    /// Returns `true` if the entry is gone.
    #[inline]
    #[must_use]
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::Deleted | Self::MovedOut)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::MovedIn => "moved_in",
            Self::MovedOut => "moved_out",
            Self::Modified => "modified",
        };
        f.write_str(name)
    }
}

/// A delivered notification: what happened, and to which path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The kind of change.
    pub kind: EventKind,
    /// The affected entry.
    pub path: WatchPath,
}

impl WatchEvent {
    /// Creates a new event.
    #[inline]
    #[must_use]
    pub const fn new(kind: EventKind, path: WatchPath) -> Self {
        Self { kind, path }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// Receives change notifications.
///
/// Listeners are invoked on the dispatcher's delivery thread, never on the
/// thread that called `register`. A panicking listener is logged and does
/// not affect other listeners.
///
/// Closures of the right shape are listeners:
///
/// ```
/// use dirwatch::{EventKind, ListenerHandle};
/// use dirwatch_core::WatchPath;
///
/// let listener = ListenerHandle::new(|kind: EventKind, path: &WatchPath| {
///     println!("{kind} {path}");
/// });
/// # drop(listener);
/// ```
pub trait Listener: Send + Sync + 'static {
    /// Called once per delivered event.
    fn on_event(&self, kind: EventKind, path: &WatchPath);
}

impl<F> Listener for F
where
    F: Fn(EventKind, &WatchPath) + Send + Sync + 'static,
{
    fn on_event(&self, kind: EventKind, path: &WatchPath) {
        self(kind, path);
    }
}

/// A shared, identity-compared reference to a [`Listener`].
#[derive(Clone)]
pub struct ListenerHandle(Arc<dyn Listener>);

impl ListenerHandle {
    /// Wraps a listener in a new handle.
    #[must_use]
    pub fn new(listener: impl Listener) -> Self {
        Self(Arc::new(listener))
    }

    /// Invokes the listener.
    #[inline]
    pub fn notify(&self, kind: EventKind, path: &WatchPath) {
        self.0.on_event(kind, path);
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl From<Arc<dyn Listener>> for ListenerHandle {
    fn from(listener: Arc<dyn Listener>) -> Self {
        Self(listener)
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ListenerHandle {}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle({:#x})", self.addr())
    }
}

/// Creates a listener that forwards every event into an unbounded channel.
///
/// Useful for consuming events from async code, or for waiting on them in
/// tests.
///
/// # Examples
///
/// ```
/// use dirwatch::{EventKind, channel_listener};
/// use dirwatch_core::WatchPath;
///
/// let (listener, mut events) = channel_listener();
/// listener.notify(EventKind::Created, &WatchPath::new("/tmp/x").unwrap());
/// let event = events.try_recv().unwrap();
/// assert_eq!(event.kind, EventKind::Created);
/// ```
#[must_use]
pub fn channel_listener() -> (ListenerHandle, mpsc::UnboundedReceiver<WatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = ListenerHandle::new(move |kind: EventKind, path: &WatchPath| {
        // A dropped receiver just means nobody is interested any more.
        let _ = tx.send(WatchEvent::new(kind, path.clone()));
    });
    (listener, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_kind_classification() {
        assert!(EventKind::Created.is_structural());
        assert!(EventKind::MovedOut.is_structural());
        assert!(!EventKind::Modified.is_structural());
        assert!(EventKind::MovedIn.is_addition());
        assert!(EventKind::Deleted.is_removal());
        assert!(!EventKind::Modified.is_removal());
    }

    #[test]
    fn test_listener_handle_identity() {
        let a = ListenerHandle::new(|_: EventKind, _: &WatchPath| {});
        let b = ListenerHandle::new(|_: EventKind, _: &WatchPath| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_listener_handle_notify() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = ListenerHandle::new(move |_: EventKind, _: &WatchPath| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let path = WatchPath::new("/a").unwrap();
        listener.notify(EventKind::Modified, &path);
        listener.notify(EventKind::Deleted, &path);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, mut rx) = channel_listener();
        let path = WatchPath::new("/a/b").unwrap();
        listener.notify(EventKind::MovedIn, &path);
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchEvent::new(EventKind::MovedIn, path)
        );
    }

    #[test]
    fn test_watch_event_display() {
        let event = WatchEvent::new(EventKind::MovedOut, WatchPath::new("/a/b").unwrap());
        assert_eq!(event.to_string(), "moved_out /a/b");
    }
}
