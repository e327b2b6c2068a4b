//! Portable watch source built on the `notify` crate.
//!
//! `notify` reports paths rather than watch handles, so events are
//! attributed by path: an event whose parent is watched is a child event of
//! that observer, otherwise an event on a watched path is a self event.
//! When a directory and its parent are both watched, changes to the
//! directory itself are attributed to the parent only.
//!
//! Backends that canonicalize paths (FSEvents reports `/private/var` for
//! `/var`) only match observers armed on canonical paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dirwatch_core::{FxHashMap, WatchPath};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{EventSink, ObserverId, RawChange, RawEvent, SourceEvent, WatchSource};
use crate::error::WatchError;
use crate::events::EventKind;

#[derive(Default)]
struct WatchedPaths {
    by_path: FxHashMap<PathBuf, ObserverId>,
    by_id: FxHashMap<ObserverId, PathBuf>,
}

/// Watch source backed by the platform's recommended `notify` watcher.
pub struct NotifySource {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Arc<Mutex<WatchedPaths>>,
}

impl NotifySource {
    /// Creates the watcher.
    ///
    /// The event handler runs on `notify`'s own thread. It only reads the
    /// path table and forwards into `sink`, because `notify` blocks
    /// [`Watcher::watch`] on that same thread.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Notify`] if the platform watcher cannot be
    /// created.
    pub fn open(sink: EventSink) -> Result<Self, WatchError> {
        let watched = Arc::new(Mutex::new(WatchedPaths::default()));
        let table = Arc::clone(&watched);
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let translated = translate(&table.lock(), &event);
                    for event in translated {
                        if sink.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(error = %err, "notify backend error"),
            }
        })?;

        debug!("notify source started");
        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            watched,
        })
    }
}

impl WatchSource for NotifySource {
    fn add(&self, id: ObserverId, path: &WatchPath) -> Result<(), WatchError> {
        let key = path.as_std_path().to_path_buf();
        {
            let mut watched = self.watched.lock();
            watched.by_path.insert(key.clone(), id);
            watched.by_id.insert(id, key.clone());
        }

        let result = match self.watcher.lock().as_mut() {
            Some(watcher) => watcher
                .watch(&key, RecursiveMode::NonRecursive)
                .map_err(|err| WatchError::from_notify(path, err)),
            None => Err(WatchError::Closed),
        };
        if result.is_err() {
            let mut watched = self.watched.lock();
            watched.by_path.remove(&key);
            watched.by_id.remove(&id);
        } else {
            trace!(observer = %id, %path, "notify watch added");
        }
        result
    }

    fn remove(&self, id: ObserverId) {
        let path = {
            let mut watched = self.watched.lock();
            let Some(path) = watched.by_id.remove(&id) else {
                return;
            };
            if watched.by_path.get(&path) == Some(&id) {
                watched.by_path.remove(&path);
            }
            path
        };
        if let Some(watcher) = self.watcher.lock().as_mut() {
            if let Err(err) = watcher.unwatch(&path) {
                trace!(observer = %id, error = %err, "notify watch already gone");
            }
        }
    }

    fn shutdown(&self) {
        // Dropping the watcher stops its thread, which drops the sink.
        drop(self.watcher.lock().take());
    }

    fn name(&self) -> &'static str {
        "notify"
    }
}

fn translate(watched: &WatchedPaths, event: &notify::Event) -> SmallVec<[SourceEvent; 2]> {
    let mut out = SmallVec::new();
    if event.need_rescan() {
        out.push(SourceEvent::Overflow);
        return out;
    }

    let Some(path) = event.paths.first() else {
        return out;
    };
    let (kind, is_dir) = match event.kind {
        notify::EventKind::Create(create) => {
            (EventKind::Created, create == CreateKind::Folder || path.is_dir())
        }
        notify::EventKind::Remove(remove) => (EventKind::Deleted, remove == RemoveKind::Folder),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            (EventKind::MovedOut, false)
        }
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            (EventKind::MovedIn, path.is_dir())
        }
        // Both halves of a rename are also reported separately.
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return out,
        notify::EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                (EventKind::MovedIn, path.is_dir())
            } else {
                (EventKind::MovedOut, false)
            }
        }
        notify::EventKind::Modify(_) => (EventKind::Modified, false),
        notify::EventKind::Access(_) | notify::EventKind::Any | notify::EventKind::Other => {
            return out;
        }
    };

    if let Some(event) = classify(watched, path, kind, is_dir) {
        out.push(event.into());
    }
    out
}

fn classify(watched: &WatchedPaths, path: &Path, kind: EventKind, is_dir: bool) -> Option<RawEvent> {
    let parent = path.parent().and_then(|parent| watched.by_path.get(parent));
    if let Some(&observer) = parent {
        let name = path.file_name()?.to_str()?;
        return Some(RawEvent::child(observer, kind, name, is_dir));
    }

    let observer = *watched.by_path.get(path)?;
    let change = match kind {
        EventKind::Deleted => RawChange::SelfDeleted,
        EventKind::MovedOut => RawChange::SelfMoved,
        EventKind::Modified => RawChange::SelfModified,
        EventKind::Created | EventKind::MovedIn => return None,
    };
    Some(RawEvent { observer, change })
}

#[cfg(test)]
mod tests {
    use notify::event::{DataChange, Event};

    use super::*;

    fn table(entries: &[(&str, u64)]) -> WatchedPaths {
        let mut watched = WatchedPaths::default();
        for &(path, id) in entries {
            watched.by_path.insert(PathBuf::from(path), ObserverId::new(id));
            watched.by_id.insert(ObserverId::new(id), PathBuf::from(path));
        }
        watched
    }

    fn event(kind: notify::EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_child_event_attributed_to_parent() {
        let watched = table(&[("/sdcard", 1)]);
        let out = translate(
            &watched,
            &event(notify::EventKind::Create(CreateKind::Folder), "/sdcard/DCIM"),
        );
        assert_eq!(
            out.as_slice(),
            &[SourceEvent::Raw(RawEvent::child(
                ObserverId::new(1),
                EventKind::Created,
                "DCIM",
                true
            ))]
        );
    }

    #[test]
    fn test_self_event_when_parent_unwatched() {
        let watched = table(&[("/sdcard/DCIM", 2)]);
        let out = translate(
            &watched,
            &event(notify::EventKind::Remove(RemoveKind::Folder), "/sdcard/DCIM"),
        );
        assert_eq!(
            out.as_slice(),
            &[SourceEvent::Raw(RawEvent {
                observer: ObserverId::new(2),
                change: RawChange::SelfDeleted,
            })]
        );
    }

    #[test]
    fn test_parent_wins_over_self() {
        let watched = table(&[("/sdcard", 1), ("/sdcard/DCIM", 2)]);
        let out = translate(
            &watched,
            &event(
                notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                "/sdcard/DCIM",
            ),
        );
        assert_eq!(
            out.as_slice(),
            &[SourceEvent::Raw(RawEvent::child(
                ObserverId::new(1),
                EventKind::MovedOut,
                "DCIM",
                false
            ))]
        );
    }

    #[test]
    fn test_ignored_kinds() {
        let watched = table(&[("/sdcard", 1)]);
        let both = event(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            "/sdcard/a",
        );
        assert!(translate(&watched, &both).is_empty());
        let access = event(notify::EventKind::Access(notify::event::AccessKind::Any), "/sdcard/a");
        assert!(translate(&watched, &access).is_empty());
        let unrelated = event(
            notify::EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            "/elsewhere/a",
        );
        assert!(translate(&watched, &unrelated).is_empty());
    }

    #[test]
    fn test_modify_maps_to_modified() {
        let watched = table(&[("/sdcard", 1)]);
        let out = translate(
            &watched,
            &event(
                notify::EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/sdcard/notes.txt",
            ),
        );
        assert_eq!(
            out.as_slice(),
            &[SourceEvent::Raw(RawEvent::child(
                ObserverId::new(1),
                EventKind::Modified,
                "notes.txt",
                false
            ))]
        );
    }

    #[test]
    fn test_rescan_reports_overflow() {
        let watched = table(&[]);
        let rescan = Event::new(notify::EventKind::Other).set_flag(notify::event::Flag::Rescan);
        assert_eq!(translate(&watched, &rescan).as_slice(), &[SourceEvent::Overflow]);
    }
}
