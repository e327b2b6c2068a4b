//! The public watch service.
//!
//! [`WatchService`] ties together a [`WatchRegistry`], a native
//! [`WatchSource`], and an [`EventDispatcher`]. The source and dispatcher
//! threads start on the first registration, so an unused service costs
//! nothing beyond its allocation.
//!
//! # Shared and Private Instances
//!
//! [`WatchService::get`] returns the process-wide instance, which lives for
//! the whole process and refuses [`close`](WatchService::close).
//! [`WatchService::create`] and [`WatchService::with_config`] return private
//! instances that the caller must close (or drop) when done.
//!
//! Private instances have their own native handle, so the same directory
//! watched by two instances is armed twice. With the `notify` backend on
//! some platforms the two watches share kernel state, and removing one may
//! silence the other.

use std::fmt;
use std::sync::{Arc, LazyLock};

use dirwatch_core::{WatchConfig, WatchPath};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatcher::EventDispatcher;
use crate::error::WatchError;
use crate::events::ListenerHandle;
use crate::filter::PathFilter;
use crate::registry::{RegistrySnapshot, WatchRegistry};
use crate::source::{self, WatchSource};

static SHARED: LazyLock<WatchService> =
    LazyLock::new(|| WatchService::build(WatchConfig::default(), PathFilter::default(), true));

enum Pipeline {
    Idle,
    Running {
        source: Arc<dyn WatchSource>,
        dispatcher: EventDispatcher,
    },
    Closed,
}

struct Inner {
    shared: bool,
    config: WatchConfig,
    filter: PathFilter,
    registry: Arc<WatchRegistry>,
    pipeline: Mutex<Pipeline>,
}

impl Inner {
    fn shut_down(&self) -> usize {
        let pipeline = std::mem::replace(&mut *self.pipeline.lock(), Pipeline::Closed);
        let stopped = self.registry.close();
        if let Pipeline::Running { source, mut dispatcher } = pipeline {
            source.shutdown();
            drop(source);
            dispatcher.join();
        }
        stopped
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !matches!(*self.pipeline.lock(), Pipeline::Closed) {
            self.shut_down();
        }
    }
}

/// Directory-change notifications with shared, reference-counted native
/// watches.
///
/// Cloning is cheap and yields a handle to the same service.
///
/// # Examples
///
/// ```no_run
/// use dirwatch::{EventKind, ListenerHandle, WatchService};
/// use dirwatch_core::WatchPath;
///
/// # fn main() -> Result<(), dirwatch::WatchError> {
/// let service = WatchService::create();
/// let path = WatchPath::new("/sdcard/DCIM")?;
/// let listener = ListenerHandle::new(|kind: EventKind, path: &WatchPath| {
///     println!("{kind} {path}");
/// });
///
/// service.register(&path, &listener)?;
/// // ... later
/// service.unregister(&path, &listener);
/// service.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WatchService {
    inner: Arc<Inner>,
}

impl WatchService {
    fn build(config: WatchConfig, filter: PathFilter, shared: bool) -> Self {
        let registry = Arc::new(WatchRegistry::new(filter.clone(), config.watch_children));
        Self {
            inner: Arc::new(Inner {
                shared,
                config,
                filter,
                registry,
                pipeline: Mutex::new(Pipeline::Idle),
            }),
        }
    }

    /// Returns the process-wide shared instance.
    #[must_use]
    pub fn get() -> Self {
        SHARED.clone()
    }

    /// Creates a private instance with the default configuration.
    #[must_use]
    pub fn create() -> Self {
        Self::build(WatchConfig::default(), PathFilter::default(), false)
    }

    /// Creates a private instance with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] if the configuration is invalid.
    pub fn with_config(config: WatchConfig) -> Result<Self, WatchError> {
        config.validate()?;
        let filter = PathFilter::from_config(&config)?;
        Ok(Self::build(config, filter, false))
    }

    /// Registers `listener` for changes to the immediate entries of the
    /// directory at `path`.
    ///
    /// Listeners are invoked on the service's delivery thread. Registering
    /// the same listener on the same path twice has no further effect.
    ///
    /// # Errors
    ///
    /// - [`WatchError::NotWatchable`] for paths under an ignored root
    /// - [`WatchError::NoSuchEntry`], [`WatchError::NotDirectory`],
    ///   [`WatchError::PermissionDenied`], [`WatchError::WatchLimit`] if the
    ///   directory cannot be watched
    /// - [`WatchError::Closed`] after [`close`](Self::close)
    pub fn register(&self, path: &WatchPath, listener: &ListenerHandle) -> Result<(), WatchError> {
        if !self.is_watchable(path) {
            return Err(WatchError::NotWatchable(path.clone()));
        }
        self.ensure_running()?;
        self.inner.registry.ensure_monitored(path, listener)
    }

    /// Removes `listener` from `path`.
    ///
    /// Unknown paths and listeners are ignored. Returns `true` if the
    /// listener was registered there.
    pub fn unregister(&self, path: &WatchPath, listener: &ListenerHandle) -> bool {
        self.inner.registry.release(path, listener)
    }

    /// Returns `false` for paths under an ignored pseudo-filesystem root.
    #[must_use]
    pub fn is_watchable(&self, path: &WatchPath) -> bool {
        self.inner.filter.is_watchable(path)
    }

    /// Returns `true` if `path` has at least one registered listener.
    #[must_use]
    pub fn is_monitored(&self, path: &WatchPath) -> bool {
        self.inner.registry.is_monitored(path)
    }

    /// Returns `true` if a native watch covers `path`, whether requested
    /// explicitly, installed as a child watch, or reached through an alias.
    #[must_use]
    pub fn has_observer(&self, path: &WatchPath) -> bool {
        self.inner.registry.has_observer(path)
    }

    /// Number of live native watches.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.registry.observer_count()
    }

    /// Captures the registry for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.inner.registry.snapshot()
    }

    /// Returns the configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// Returns `true` for the process-wide instance.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Returns `true` once the service has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.registry.is_closed()
    }

    /// Stops every native watch and the service's threads.
    ///
    /// Pending notifications are delivered before the threads exit, unless
    /// `close` is called from a listener. Closing twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::UnsupportedOperation`] on the shared instance.
    pub fn close(&self) -> Result<(), WatchError> {
        if self.inner.shared {
            return Err(WatchError::UnsupportedOperation(
                "the shared watch service cannot be closed",
            ));
        }
        let stopped = self.inner.shut_down();
        info!(observers = stopped, "Watch service closed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), WatchError> {
        let mut pipeline = self.inner.pipeline.lock();
        match *pipeline {
            Pipeline::Running { .. } => return Ok(()),
            Pipeline::Closed => return Err(WatchError::Closed),
            Pipeline::Idle => {}
        }

        let (sink, events) = mpsc::unbounded_channel();
        let source = source::open(&self.inner.config, sink)?;
        let dispatcher = match EventDispatcher::start(Arc::clone(&self.inner.registry), events) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                source.shutdown();
                return Err(WatchError::Source(err));
            }
        };
        self.inner.registry.attach_source(Arc::clone(&source));
        debug!(backend = source.name(), shared = self.inner.shared, "Watch service started");
        *pipeline = Pipeline::Running { source, dispatcher };
        Ok(())
    }
}

impl fmt::Debug for WatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchService")
            .field("shared", &self.inner.shared)
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
