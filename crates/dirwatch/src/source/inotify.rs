//! inotify-backed watch source.
//!
//! One inotify instance serves the whole service. Watches are armed through
//! the instance's [`Watches`] handle from any thread, while a dedicated
//! reader thread drives the event stream on a current-thread tokio runtime
//! and translates each kernel event using the descriptor table.
//!
//! The kernel hands out one watch descriptor per inode, so arming the same
//! directory twice through different paths yields the same descriptor. The
//! registry deduplicates by node identity before arming, which keeps the
//! descriptor table one-to-one.

use std::ffi::OsString;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dirwatch_core::{FxHashMap, WatchPath};
use futures_util::StreamExt;
use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::{EventSink, ObserverId, RawChange, RawEvent, SourceEvent, WatchSource};
use crate::error::WatchError;
use crate::events::EventKind;

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

#[derive(Default)]
struct DescriptorTable {
    by_wd: FxHashMap<WatchDescriptor, ObserverId>,
    by_id: FxHashMap<ObserverId, WatchDescriptor>,
}

impl DescriptorTable {
    fn insert(&mut self, id: ObserverId, wd: WatchDescriptor) {
        if let Some(previous) = self.by_wd.insert(wd.clone(), id) {
            if previous != id {
                // Only possible if a directory was replaced between the
                // identity check and arming.
                warn!(%previous, observer = %id, "Watch descriptor reassigned");
                self.by_id.remove(&previous);
            }
        }
        self.by_id.insert(id, wd);
    }

    fn forget_id(&mut self, id: ObserverId) -> Option<WatchDescriptor> {
        let wd = self.by_id.remove(&id)?;
        self.by_wd.remove(&wd);
        Some(wd)
    }

    fn forget_wd(&mut self, wd: &WatchDescriptor) -> Option<ObserverId> {
        let id = self.by_wd.remove(wd)?;
        self.by_id.remove(&id);
        Some(id)
    }
}

/// Watch source backed by a single inotify instance.
pub struct InotifySource {
    watches: Mutex<Watches>,
    table: Arc<Mutex<DescriptorTable>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl InotifySource {
    /// Initializes inotify and starts the reader thread.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Source`] if the instance cannot be created (for
    /// example when the per-user instance limit is reached) or the thread
    /// cannot be spawned.
    pub fn open(buffer_size: usize, sink: EventSink) -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(WatchError::Source)?;
        let watches = inotify.watches();
        let table = Arc::new(Mutex::new(DescriptorTable::default()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let reader_table = Arc::clone(&table);
        let reader = thread::Builder::new()
            .name("dirwatch-inotify".to_owned())
            .spawn(move || run_reader(inotify, buffer_size, &reader_table, &sink, shutdown_rx))
            .map_err(WatchError::Source)?;

        debug!(buffer_size, "inotify source started");
        Ok(Self {
            watches: Mutex::new(watches),
            table,
            shutdown: Mutex::new(Some(shutdown_tx)),
            reader: Mutex::new(Some(reader)),
        })
    }
}

impl WatchSource for InotifySource {
    fn add(&self, id: ObserverId, path: &WatchPath) -> Result<(), WatchError> {
        let wd = self
            .watches
            .lock()
            .add(path.as_std_path(), watch_mask())
            .map_err(|err| WatchError::from_io(path, err))?;
        self.table.lock().insert(id, wd);
        trace!(observer = %id, %path, "inotify watch added");
        Ok(())
    }

    fn remove(&self, id: ObserverId) {
        let Some(wd) = self.table.lock().forget_id(id) else {
            return;
        };
        // EINVAL here means the kernel already dropped the watch.
        if let Err(err) = self.watches.lock().remove(wd) {
            trace!(observer = %id, error = %err, "inotify watch already gone");
        }
    }

    fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        if reader.thread().id() == thread::current().id() {
            return;
        }
        if reader.join().is_err() {
            error!("inotify reader thread panicked");
        }
    }

    fn name(&self) -> &'static str {
        "inotify"
    }
}

impl Drop for InotifySource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_reader(
    inotify: Inotify,
    buffer_size: usize,
    table: &Mutex<DescriptorTable>,
    sink: &EventSink,
    mut shutdown: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to build inotify reader runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut stream = match inotify.into_event_stream(vec![0_u8; buffer_size]) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "Failed to open inotify event stream");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        let Some(event) = translate(table, event) else {
                            continue;
                        };
                        if sink.send(event).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "inotify read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
    });
    debug!("inotify reader stopped");
}

fn translate(table: &Mutex<DescriptorTable>, event: Event<OsString>) -> Option<SourceEvent> {
    let mask = event.mask;
    if mask.contains(EventMask::Q_OVERFLOW) {
        return Some(SourceEvent::Overflow);
    }

    if mask.contains(EventMask::IGNORED) {
        // Unknown descriptors were removed by us; nothing to report.
        let observer = table.lock().forget_wd(&event.wd)?;
        return Some(
            RawEvent {
                observer,
                change: RawChange::Stopped,
            }
            .into(),
        );
    }
    let observer = *table.lock().by_wd.get(&event.wd)?;

    let change = match event.name {
        Some(name) => {
            let Some(name) = name.to_str() else {
                debug!(observer = %observer, ?name, "Skipping non-UTF-8 entry name");
                return None;
            };
            let kind = if mask.contains(EventMask::CREATE) {
                EventKind::Created
            } else if mask.contains(EventMask::DELETE) {
                EventKind::Deleted
            } else if mask.contains(EventMask::MOVED_FROM) {
                EventKind::MovedOut
            } else if mask.contains(EventMask::MOVED_TO) {
                EventKind::MovedIn
            } else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
                EventKind::Modified
            } else {
                return None;
            };
            RawChange::Child {
                kind,
                name: name.to_owned(),
                is_dir: mask.contains(EventMask::ISDIR),
            }
        }
        None => {
            if mask.contains(EventMask::DELETE_SELF) {
                RawChange::SelfDeleted
            } else if mask.contains(EventMask::MOVE_SELF) {
                RawChange::SelfMoved
            } else if mask.intersects(EventMask::ATTRIB | EventMask::MODIFY) {
                RawChange::SelfModified
            } else {
                // IN_UNMOUNT is always followed by IN_IGNORED.
                return None;
            }
        }
    };
    Some(RawEvent { observer, change }.into())
}
