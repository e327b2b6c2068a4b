//! A single armed native watch.

use std::fmt;
use std::sync::Arc;

use dirwatch_core::WatchPath;

use crate::error::WatchError;
use crate::identity::NodeIdentity;
use crate::source::{ObserverId, WatchSource};

/// One non-recursive native watch on one directory node.
///
/// An observer is armed by [`Observer::start`] and disarmed by
/// [`Observer::stop`] or when dropped. Stopping is idempotent and a stopped
/// observer is never resumed; re-watching the node arms a new observer.
pub struct Observer {
    id: ObserverId,
    path: WatchPath,
    identity: NodeIdentity,
    source: Arc<dyn WatchSource>,
    stopped: bool,
}

impl Observer {
    /// Arms a watch on `path` through `source`.
    ///
    /// # Errors
    ///
    /// Returns the source's classified error if the watch cannot be armed.
    pub fn start(
        source: &Arc<dyn WatchSource>,
        id: ObserverId,
        path: WatchPath,
        identity: NodeIdentity,
    ) -> Result<Self, WatchError> {
        source.add(id, &path)?;
        tracing::debug!(observer = %id, %path, %identity, backend = source.name(), "Observer started");
        Ok(Self {
            id,
            path,
            identity,
            source: Arc::clone(source),
            stopped: false,
        })
    }

    /// Disarms the watch. Further calls do nothing.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.source.remove(self.id);
        tracing::debug!(observer = %self.id, path = %self.path, "Observer stopped");
    }

    /// Returns the observer's id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Returns the path the watch was armed through.
    #[inline]
    #[must_use]
    pub const fn path(&self) -> &WatchPath {
        &self.path
    }

    /// Returns the identity of the watched node.
    #[inline]
    #[must_use]
    pub const fn identity(&self) -> NodeIdentity {
        self.identity
    }

    /// Returns `true` once [`Observer::stop`] has run.
    #[inline]
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
