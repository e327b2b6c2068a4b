//! Watch registry: observers, path records, and reference counts.
//!
//! The registry owns every live [`Observer`] of a watch service. Each
//! observer watches one physical directory node ([`NodeIdentity`]) and may be
//! reachable through several path strings; every such path has its own
//! record with its own listeners and child references.
//!
//! # Entry Model
//!
//! ```text
//! WatchEntry (one per NodeIdentity, owns the Observer)
//!   └── PathRecord (one per path string reaching the node)
//!         ├── listeners     explicit registrations on this path
//!         ├── child_refs    monitored parents that installed this path
//!         └── children      child paths this path installed while monitored
//! ```
//!
//! An entry is *monitored* while any of its records has listeners and
//! *child-only* otherwise. A record is pruned when it has neither listeners
//! nor child references, and an entry is destroyed (stopping its observer)
//! when its last record goes.
//!
//! # Locking
//!
//! All state sits behind one [`RwLock`]. Registration, unregistration, and
//! event routing take the write lock; queries take the read lock and always
//! see a consistent state. Native watches are armed and disarmed while the
//! write lock is held, which is safe because sources never call back into
//! the registry.

use std::fs;
use std::mem;
use std::sync::Arc;

use dirwatch_core::{FxHashMap, FxHashSet, WatchPath, fx_hash_map};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::error::WatchError;
use crate::events::{EventKind, ListenerHandle};
use crate::filter::PathFilter;
use crate::identity::{NodeIdentity, identity_of};
use crate::observer::Observer;
use crate::source::{ObserverId, RawChange, RawEvent, SourceEvent, WatchSource};

/// Listeners registered on one path.
pub type ListenerSet = SmallVec<[ListenerHandle; 2]>;

/// One notification bound for the listeners of one monitored path.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The kind of change.
    pub kind: EventKind,
    /// The affected entry.
    pub path: WatchPath,
    /// The monitored path whose listeners receive the event.
    pub subscription: WatchPath,
    /// The listeners registered on `subscription` when the event was routed.
    pub listeners: ListenerSet,
}

#[derive(Debug, Default)]
struct PathRecord {
    listeners: ListenerSet,
    child_refs: u32,
    children: FxHashSet<WatchPath>,
    children_installed: bool,
}

impl PathRecord {
    fn is_monitored(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn is_unused(&self) -> bool {
        self.listeners.is_empty() && self.child_refs == 0
    }

    fn ref_count(&self) -> u32 {
        self.child_refs + u32::from(self.is_monitored())
    }
}

#[derive(Debug)]
struct WatchEntry {
    observer: Observer,
    records: FxHashMap<WatchPath, PathRecord>,
}

#[derive(Default)]
struct RegistryState {
    source: Option<Arc<dyn WatchSource>>,
    entries: FxHashMap<ObserverId, WatchEntry>,
    by_path: FxHashMap<WatchPath, ObserverId>,
    by_identity: FxHashMap<NodeIdentity, ObserverId>,
    next_id: u64,
    closed: bool,
}

impl RegistryState {
    fn ensure_open(&self) -> Result<(), WatchError> {
        if self.closed {
            Err(WatchError::Closed)
        } else {
            Ok(())
        }
    }

    fn record(&self, path: &WatchPath) -> Option<&PathRecord> {
        let id = self.by_path.get(path)?;
        self.entries.get(id)?.records.get(path)
    }

    fn record_mut(&mut self, path: &WatchPath) -> Option<&mut PathRecord> {
        let id = *self.by_path.get(path)?;
        self.entries.get_mut(&id)?.records.get_mut(path)
    }

    /// Makes `path` a record of the entry for `identity`.
    ///
    /// A record still bound to a node that has since been replaced keeps its
    /// listeners and child references but is moved to the new node; the
    /// children it installed for the old node are released.
    fn bind(&mut self, path: &WatchPath, identity: NodeIdentity) -> Result<ObserverId, WatchError> {
        let stale = match self.by_path.get(path).and_then(|id| self.entries.get(id).map(|e| (*id, e))) {
            Some((id, entry)) if entry.observer.identity() == identity => return Ok(id),
            Some((_, entry)) => {
                info!(%path, old = %entry.observer.identity(), new = %identity, "Directory replaced, rebinding watch");
                true
            }
            None => false,
        };

        let record = if stale {
            let mut record = self.detach_record(path).unwrap_or_default();
            record.children_installed = false;
            for child in mem::take(&mut record.children) {
                self.release_child(&child);
            }
            record
        } else {
            PathRecord::default()
        };

        let listeners = record.listeners.len();
        self.attach_record(path, identity, record).inspect_err(|err| {
            if listeners > 0 {
                warn!(%path, error = %err, listeners, "Dropped registrations on replaced directory");
            }
        })
    }

    fn attach_record(
        &mut self,
        path: &WatchPath,
        identity: NodeIdentity,
        record: PathRecord,
    ) -> Result<ObserverId, WatchError> {
        if let Some(&id) = self.by_identity.get(&identity) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.records.insert(path.clone(), record);
                self.by_path.insert(path.clone(), id);
                debug!(%path, observer = %id, "Path aliased to existing observer");
                return Ok(id);
            }
        }

        let source = self.source.clone().ok_or(WatchError::Closed)?;
        self.next_id += 1;
        let id = ObserverId::new(self.next_id);
        let observer = Observer::start(&source, id, path.clone(), identity)?;

        let mut records = fx_hash_map();
        records.insert(path.clone(), record);
        self.entries.insert(id, WatchEntry { observer, records });
        self.by_path.insert(path.clone(), id);
        self.by_identity.insert(identity, id);
        Ok(id)
    }

    /// Removes the record for `path`, destroying its entry if it was the last.
    fn detach_record(&mut self, path: &WatchPath) -> Option<PathRecord> {
        let id = self.by_path.remove(path)?;
        let entry = self.entries.get_mut(&id)?;
        let record = entry.records.remove(path);
        if entry.records.is_empty() {
            self.remove_entry(id);
        }
        record
    }

    fn remove_entry(&mut self, id: ObserverId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        let identity = entry.observer.identity();
        if self.by_identity.get(&identity) == Some(&id) {
            self.by_identity.remove(&identity);
        }
        for path in entry.records.keys() {
            if self.by_path.get(path) == Some(&id) {
                self.by_path.remove(path);
            }
        }
        // Dropping the entry stops its observer.
        drop(entry);
    }

    fn prune(&mut self, path: &WatchPath) {
        if !self.record(path).is_some_and(PathRecord::is_unused) {
            return;
        }
        if let Some(record) = self.detach_record(path) {
            trace!(%path, "Pruned unused watch");
            for child in record.children {
                self.release_child(&child);
            }
        }
    }

    fn acquire_child(
        &mut self,
        parent: &WatchPath,
        child: &WatchPath,
        identity: NodeIdentity,
    ) -> Result<(), WatchError> {
        self.bind(child, identity)?;
        let newly = self
            .record_mut(parent)
            .is_some_and(|record| record.children.insert(child.clone()));
        if newly {
            if let Some(record) = self.record_mut(child) {
                record.child_refs += 1;
            }
        } else {
            self.prune(child);
        }
        Ok(())
    }

    fn release_child(&mut self, child: &WatchPath) {
        let Some(record) = self.record_mut(child) else {
            return;
        };
        record.child_refs = record.child_refs.saturating_sub(1);
        self.prune(child);
    }

    fn release_listener(&mut self, path: &WatchPath, listener: &ListenerHandle) -> bool {
        let Some(record) = self.record_mut(path) else {
            return false;
        };
        let Some(position) = record.listeners.iter().position(|l| l == listener) else {
            return false;
        };
        record.listeners.remove(position);
        if record.listeners.is_empty() {
            record.children_installed = false;
            for child in mem::take(&mut record.children) {
                self.release_child(&child);
            }
            self.prune(path);
        }
        true
    }

    /// Destroys an entry whose node is gone, with every record on it.
    fn tear_down(&mut self, id: ObserverId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let paths: SmallVec<[WatchPath; 2]> = entry.records.keys().cloned().collect();
        for path in paths {
            self.drop_record(&path);
        }
        debug!(observer = %id, "Observer torn down");
    }

    /// Removes the record for `path` whatever its references, unlinking it
    /// from the parent that installed it.
    fn drop_record(&mut self, path: &WatchPath) {
        let Some(record) = self.detach_record(path) else {
            return;
        };
        for child in &record.children {
            self.release_child(child);
        }
        if record.child_refs > 0 {
            if let Some(parent) = path.parent().as_ref().and_then(|p| self.record_mut(p)) {
                parent.children.remove(path);
            }
        }
    }

    /// Handles the watched node being renamed.
    ///
    /// Records whose path no longer reaches the node are dropped, and their
    /// listeners told the path moved out. Records that already reach the
    /// node under its new name, such as a rename inside a monitored parent,
    /// keep the observer alive.
    fn retire_moved(&mut self, id: ObserverId) -> Vec<Delivery> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        let identity = entry.observer.identity();
        let (kept, gone): (Vec<&WatchPath>, Vec<&WatchPath>) = entry
            .records
            .keys()
            .partition(|path| identity_of(path).is_ok_and(|current| current == identity));

        if kept.is_empty() {
            let deliveries = self.self_deliveries(id, EventKind::MovedOut);
            self.tear_down(id);
            return deliveries;
        }

        let deliveries: Vec<Delivery> = gone
            .iter()
            .filter_map(|path| {
                let record = entry.records.get(*path)?;
                record.is_monitored().then(|| Delivery {
                    kind: EventKind::MovedOut,
                    path: (*path).clone(),
                    subscription: (*path).clone(),
                    listeners: record.listeners.clone(),
                })
            })
            .collect();
        let kept = kept.len();
        let gone: Vec<WatchPath> = gone.into_iter().cloned().collect();
        for path in &gone {
            self.drop_record(path);
        }
        debug!(observer = %id, dropped = gone.len(), kept, "Observer renamed");
        deliveries
    }

    fn self_deliveries(&self, id: ObserverId, kind: EventKind) -> Vec<Delivery> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };
        entry
            .records
            .iter()
            .filter(|(_, record)| record.is_monitored())
            .map(|(path, record)| Delivery {
                kind,
                path: path.clone(),
                subscription: path.clone(),
                listeners: record.listeners.clone(),
            })
            .collect()
    }
}

fn is_skippable_child_error(err: &WatchError) -> bool {
    matches!(
        err,
        WatchError::NoSuchEntry(_) | WatchError::NotDirectory(_) | WatchError::PermissionDenied(_)
    )
}

/// Whether an entry currently serves explicit registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// At least one path reaching the node has listeners.
    Monitored,
    /// The node is only watched as the child of a monitored directory.
    ChildOnly,
}

/// One path reaching a watched node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSnapshot {
    /// The path string.
    pub path: WatchPath,
    /// Number of listeners registered on this path.
    pub listeners: usize,
    /// Number of monitored parents that installed this path.
    pub child_refs: u32,
}

/// One live observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// The observer's id.
    pub observer: ObserverId,
    /// The watched node.
    pub identity: NodeIdentity,
    /// Monitored or child-only.
    pub kind: EntryKind,
    /// Reasons the entry exists: child references plus one per monitored
    /// path. Always at least one.
    pub ref_count: u32,
    /// Every path reaching the node, sorted.
    pub paths: Vec<PathSnapshot>,
}

/// Point-in-time view of a registry, for diagnostics and tests.
///
/// # Examples
///
/// ```
/// use dirwatch::WatchService;
///
/// let service = WatchService::create();
/// let snapshot = service.snapshot();
/// assert!(snapshot.entries.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Live entries, sorted by their first path.
    pub entries: Vec<EntrySnapshot>,
}

impl RegistrySnapshot {
    /// Finds the entry reachable through `path`.
    #[must_use]
    pub fn find(&self, path: &WatchPath) -> Option<&EntrySnapshot> {
        self.entries
            .iter()
            .find(|entry| entry.paths.iter().any(|p| &p.path == path))
    }
}

/// Owns the observers of one watch service.
pub struct WatchRegistry {
    state: RwLock<RegistryState>,
    filter: PathFilter,
    watch_children: bool,
}

impl WatchRegistry {
    /// Creates an empty registry.
    ///
    /// Nothing can be watched until a source is attached.
    #[must_use]
    pub fn new(filter: PathFilter, watch_children: bool) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            filter,
            watch_children,
        }
    }

    /// Sets the source new observers are armed through.
    pub fn attach_source(&self, source: Arc<dyn WatchSource>) {
        self.state.write().source = Some(source);
    }

    /// Registers `listener` on the directory at `path`, arming watches on it
    /// and on its immediate child directories as needed.
    ///
    /// Registering the same listener on the same path twice is a no-op.
    /// If a child watch fails for a reason other than the child vanishing,
    /// becoming a file, or being unreadable, the whole registration is
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Closed`] after [`close`](Self::close), the
    /// classified error if `path` cannot be resolved or armed, or the first
    /// fatal child error.
    pub fn ensure_monitored(&self, path: &WatchPath, listener: &ListenerHandle) -> Result<(), WatchError> {
        let identity = identity_of(path)?;
        let mut state = self.state.write();
        state.ensure_open()?;
        state.bind(path, identity)?;

        let install = {
            let Some(record) = state.record_mut(path) else {
                return Err(WatchError::NoSuchEntry(path.clone()));
            };
            if record.listeners.contains(listener) {
                return Ok(());
            }
            record.listeners.push(listener.clone());
            let install = self.watch_children && !record.children_installed;
            record.children_installed |= install;
            install
        };

        if install {
            if let Err(err) = self.install_children(&mut state, path) {
                warn!(%path, error = %err, "Rolling back registration");
                state.release_listener(path, listener);
                return Err(err);
            }
        }
        info!(%path, %identity, "Monitoring directory");
        Ok(())
    }

    fn install_children(&self, state: &mut RegistryState, parent: &WatchPath) -> Result<(), WatchError> {
        let entries = match fs::read_dir(parent.as_std_path()) {
            Ok(entries) => entries,
            Err(err) => {
                let err = WatchError::from_io(parent, err);
                if let WatchError::PermissionDenied(_) = err {
                    debug!(%parent, "Directory not listable, watching without children");
                    return Ok(());
                }
                return Err(err);
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(%parent, error = %err, "Skipping unreadable entry");
                    continue;
                }
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() && !file_type.is_symlink() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                debug!(%parent, name = ?file_name, "Skipping non-UTF-8 child");
                continue;
            };
            let Ok(child) = parent.child(name) else {
                continue;
            };
            if !self.filter.is_watchable(&child) {
                continue;
            }

            let result = identity_of(&child).and_then(|identity| state.acquire_child(parent, &child, identity));
            match result {
                Ok(()) => {}
                Err(err) if is_skippable_child_error(&err) => {
                    trace!(%child, error = %err, "Skipping child directory");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Removes `listener` from `path`. Returns `false` if it was not
    /// registered there.
    ///
    /// When the last listener leaves, the child watches the path installed
    /// are released and the path's own watch is destroyed unless a monitored
    /// parent still needs it.
    pub fn release(&self, path: &WatchPath, listener: &ListenerHandle) -> bool {
        let released = self.state.write().release_listener(path, listener);
        if released {
            debug!(%path, "Listener released");
        }
        released
    }

    /// Returns `true` if `path` has at least one listener.
    #[must_use]
    pub fn is_monitored(&self, path: &WatchPath) -> bool {
        self.state.read().record(path).is_some_and(PathRecord::is_monitored)
    }

    /// Returns `true` if a live observer watches `path`, either through
    /// that path string or through an alias of the same node.
    #[must_use]
    pub fn has_observer(&self, path: &WatchPath) -> bool {
        if self.state.read().by_path.contains_key(path) {
            return true;
        }
        let Ok(identity) = identity_of(path) else {
            return false;
        };
        self.state.read().by_identity.contains_key(&identity)
    }

    /// Returns `true` if `listener` is still registered on `subscription`.
    #[must_use]
    pub fn is_subscribed(&self, subscription: &WatchPath, listener: &ListenerHandle) -> bool {
        self.state
            .read()
            .record(subscription)
            .is_some_and(|record| record.listeners.contains(listener))
    }

    /// Number of live observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Captures the current entries.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let mut entries: Vec<EntrySnapshot> = state
            .entries
            .iter()
            .map(|(&observer, entry)| {
                let mut paths: Vec<PathSnapshot> = entry
                    .records
                    .iter()
                    .map(|(path, record)| PathSnapshot {
                        path: path.clone(),
                        listeners: record.listeners.len(),
                        child_refs: record.child_refs,
                    })
                    .collect();
                paths.sort_by(|a, b| a.path.cmp(&b.path));
                let monitored = entry.records.values().any(PathRecord::is_monitored);
                EntrySnapshot {
                    observer,
                    identity: entry.observer.identity(),
                    kind: if monitored {
                        EntryKind::Monitored
                    } else {
                        EntryKind::ChildOnly
                    },
                    ref_count: entry.records.values().map(PathRecord::ref_count).sum(),
                    paths,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.paths.first().map(|p| &p.path).cmp(&b.paths.first().map(|p| &p.path)));
        RegistrySnapshot { entries }
    }

    /// Applies one source event and returns the notifications it produces.
    ///
    /// Structural child events keep the child watches of monitored paths in
    /// sync. Self deletion destroys the entry after notifying its listeners;
    /// a rename only drops the paths that no longer reach the node.
    pub fn apply(&self, event: SourceEvent) -> Vec<Delivery> {
        let RawEvent { observer, change } = match event {
            SourceEvent::Raw(event) => event,
            SourceEvent::Overflow => {
                warn!("Native event queue overflowed, changes were lost");
                return Vec::new();
            }
        };

        let mut state = self.state.write();
        match change {
            RawChange::Child { kind, name, is_dir } => {
                self.route_child(&mut state, observer, kind, &name, is_dir)
            }
            RawChange::SelfModified => state.self_deliveries(observer, EventKind::Modified),
            RawChange::SelfDeleted => {
                let deliveries = state.self_deliveries(observer, EventKind::Deleted);
                state.tear_down(observer);
                deliveries
            }
            RawChange::SelfMoved => state.retire_moved(observer),
            RawChange::Stopped => {
                state.tear_down(observer);
                Vec::new()
            }
        }
    }

    fn route_child(
        &self,
        state: &mut RegistryState,
        observer: ObserverId,
        kind: EventKind,
        name: &str,
        is_dir: bool,
    ) -> Vec<Delivery> {
        let Some(entry) = state.entries.get(&observer) else {
            trace!(%observer, name, "Event for retired observer");
            return Vec::new();
        };
        let paths: SmallVec<[WatchPath; 2]> = entry.records.keys().cloned().collect();

        let mut deliveries = Vec::new();
        for path in &paths {
            let child = match path.child(name) {
                Ok(child) => child,
                Err(err) => {
                    debug!(%path, error = %err, "Ignoring event with invalid name");
                    continue;
                }
            };

            if let Some(record) = state.record(path) {
                if record.is_monitored() {
                    deliveries.push(Delivery {
                        kind,
                        path: child.clone(),
                        subscription: path.clone(),
                        listeners: record.listeners.clone(),
                    });
                } else if record.child_refs > 0 {
                    // A child-only path reports to the monitored parent that
                    // installed it.
                    if let Some(parent) = path.parent() {
                        let parent_record = state
                            .record(&parent)
                            .filter(|r| r.is_monitored() && r.children.contains(path));
                        if let Some(parent_record) = parent_record {
                            deliveries.push(Delivery {
                                kind,
                                path: child.clone(),
                                subscription: parent.clone(),
                                listeners: parent_record.listeners.clone(),
                            });
                        }
                    }
                }
            }

            if kind.is_structural() {
                self.follow_structure(state, path, &child, kind, is_dir);
            }
        }
        deliveries
    }

    fn follow_structure(
        &self,
        state: &mut RegistryState,
        parent: &WatchPath,
        child: &WatchPath,
        kind: EventKind,
        is_dir: bool,
    ) {
        if kind.is_addition() {
            let wanted = is_dir
                && self.watch_children
                && self.filter.is_watchable(child)
                && state
                    .record(parent)
                    .is_some_and(|r| r.is_monitored() && r.children_installed);
            if !wanted {
                return;
            }
            let result = identity_of(child).and_then(|identity| state.acquire_child(parent, child, identity));
            match result {
                Ok(()) => debug!(%child, "Watching new child directory"),
                Err(err) if is_skippable_child_error(&err) => {
                    debug!(%child, error = %err, "Child directory gone before it could be watched");
                }
                Err(err) => warn!(%child, error = %err, "Failed to watch new child directory"),
            }
        } else {
            let removed = state
                .record_mut(parent)
                .is_some_and(|record| record.children.remove(child));
            if removed {
                state.release_child(child);
                debug!(%child, "Released child directory");
            }
        }
    }

    /// Stops every observer and refuses further registrations.
    ///
    /// Returns the number of observers stopped; a second call returns zero.
    pub fn close(&self) -> usize {
        let mut state = self.state.write();
        if state.closed {
            return 0;
        }
        state.closed = true;
        state.source = None;
        state.by_path.clear();
        state.by_identity.clear();
        let entries = mem::take(&mut state.entries);
        let stopped = entries.len();
        drop(entries);
        stopped
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("WatchRegistry")
            .field("observers", &state.entries.len())
            .field("paths", &state.by_path.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::source::fake::FakeSource;

    struct Fixture {
        temp: TempDir,
        source: Arc<FakeSource>,
        registry: WatchRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let source = Arc::new(FakeSource::default());
            let registry = fake_registry(&source, PathFilter::default(), true);
            Self {
                temp: TempDir::new().unwrap(),
                source,
                registry,
            }
        }

        fn mkdir(&self, rel: &str) -> WatchPath {
            let path = self.temp.path().join(rel);
            fs::create_dir_all(&path).unwrap();
            watch_path(&path)
        }

        fn path(&self, rel: &str) -> WatchPath {
            watch_path(&self.temp.path().join(rel))
        }

        fn id_of(&self, path: &WatchPath) -> ObserverId {
            self.source.id_of(path).unwrap()
        }
    }

    fn fake_registry(source: &Arc<FakeSource>, filter: PathFilter, watch_children: bool) -> WatchRegistry {
        let registry = WatchRegistry::new(filter, watch_children);
        registry.attach_source(Arc::clone(source) as Arc<dyn WatchSource>);
        registry
    }

    fn watch_path(path: &Path) -> WatchPath {
        WatchPath::from_std(path).unwrap()
    }

    fn listener() -> ListenerHandle {
        ListenerHandle::new(|_: EventKind, _: &WatchPath| {})
    }

    fn child_event(id: ObserverId, kind: EventKind, name: &str, is_dir: bool) -> SourceEvent {
        RawEvent::child(id, kind, name, is_dir).into()
    }

    #[test]
    fn test_monitor_installs_child_watches() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/a");
        fx.mkdir("D/b");
        fs::write(fx.temp.path().join("D/file.txt"), "x").unwrap();

        fx.registry.ensure_monitored(&root, &listener()).unwrap();

        assert!(fx.registry.is_monitored(&root));
        assert!(fx.registry.has_observer(&fx.path("D/a")));
        assert!(fx.registry.has_observer(&fx.path("D/b")));
        assert!(!fx.registry.is_monitored(&fx.path("D/a")));
        assert!(!fx.registry.has_observer(&fx.path("D/file.txt")));
        assert_eq!(fx.registry.observer_count(), 3);

        let snapshot = fx.registry.snapshot();
        let child = snapshot.find(&fx.path("D/a")).unwrap();
        assert_eq!(child.kind, EntryKind::ChildOnly);
        assert_eq!(child.ref_count, 1);
        assert_eq!(snapshot.find(&root).unwrap().kind, EntryKind::Monitored);
    }

    #[test]
    fn test_release_tears_down_children() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/a");
        fx.mkdir("D/b");
        let l = listener();

        fx.registry.ensure_monitored(&root, &l).unwrap();
        assert!(fx.registry.release(&root, &l));

        assert!(!fx.registry.has_observer(&root));
        assert!(!fx.registry.has_observer(&fx.path("D/a")));
        assert!(!fx.registry.has_observer(&fx.path("D/b")));
        assert_eq!(fx.registry.observer_count(), 0);
        assert!(fx.source.armed().is_empty());
        assert!(!fx.registry.release(&root, &l));
    }

    #[test]
    fn test_independently_monitored_child_survives() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        let b = fx.mkdir("D/b");
        let parent_listener = listener();
        let child_listener = listener();

        fx.registry.ensure_monitored(&root, &parent_listener).unwrap();
        fx.registry.ensure_monitored(&a, &child_listener).unwrap();
        let snapshot = fx.registry.snapshot();
        let entry = snapshot.find(&a).unwrap();
        assert_eq!(entry.kind, EntryKind::Monitored);
        assert_eq!(entry.ref_count, 2);

        fx.registry.release(&root, &parent_listener);
        assert!(fx.registry.has_observer(&a));
        assert!(fx.registry.is_monitored(&a));
        assert!(!fx.registry.has_observer(&b));

        fx.registry.release(&a, &child_listener);
        assert_eq!(fx.registry.observer_count(), 0);
    }

    #[test]
    fn test_child_released_by_parent_then_self() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        let parent_listener = listener();
        let child_listener = listener();

        fx.registry.ensure_monitored(&root, &parent_listener).unwrap();
        fx.registry.ensure_monitored(&a, &child_listener).unwrap();
        fx.registry.release(&a, &child_listener);

        // Still required by the monitored parent.
        assert!(fx.registry.has_observer(&a));
        assert!(!fx.registry.is_monitored(&a));
        assert_eq!(fx.registry.snapshot().find(&a).unwrap().kind, EntryKind::ChildOnly);
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let l = listener();
        fx.registry.ensure_monitored(&root, &l).unwrap();
        fx.registry.ensure_monitored(&root, &l).unwrap();
        assert_eq!(fx.registry.snapshot().find(&root).unwrap().paths[0].listeners, 1);

        fx.registry.release(&root, &l);
        assert!(!fx.registry.has_observer(&root));
    }

    #[test]
    fn test_alias_shares_observer() {
        let fx = Fixture::new();
        let target = fx.mkdir("storage/emulated/0");
        std::os::unix::fs::symlink(fx.temp.path().join("storage/emulated/0"), fx.temp.path().join("sdcard"))
            .unwrap();
        let alias = fx.path("sdcard");
        let first = listener();
        let second = listener();

        fx.registry.ensure_monitored(&target, &first).unwrap();
        assert!(fx.registry.has_observer(&alias));
        fx.registry.ensure_monitored(&alias, &second).unwrap();

        assert_eq!(fx.registry.observer_count(), 1);
        assert_eq!(fx.source.armed(), vec![target.clone()]);
        let snapshot = fx.registry.snapshot();
        assert_eq!(snapshot.entries[0].paths.len(), 2);
        assert_eq!(snapshot.entries[0].ref_count, 2);

        fx.registry.release(&target, &first);
        assert!(fx.registry.is_monitored(&alias));
        assert_eq!(fx.registry.observer_count(), 1);
        fx.registry.release(&alias, &second);
        assert_eq!(fx.registry.observer_count(), 0);
    }

    #[test]
    fn test_ignored_children_are_skipped() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/skip");
        fx.mkdir("D/keep");
        let registry = fake_registry(&fx.source, PathFilter::new([fx.path("D/skip")]), true);

        registry.ensure_monitored(&root, &listener()).unwrap();
        assert!(!registry.has_observer(&fx.path("D/skip")));
        assert!(registry.has_observer(&fx.path("D/keep")));
    }

    #[test]
    fn test_children_disabled() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/a");
        let registry = fake_registry(&fx.source, PathFilter::default(), false);

        registry.ensure_monitored(&root, &listener()).unwrap();
        assert!(!registry.has_observer(&fx.path("D/a")));
        assert_eq!(registry.observer_count(), 1);
    }

    #[test]
    fn test_fatal_child_failure_rolls_back() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        fx.source.fail_on(a);

        let err = fx.registry.ensure_monitored(&root, &listener()).unwrap_err();
        assert!(matches!(err, WatchError::WatchLimit(_)));
        assert!(!fx.registry.has_observer(&root));
        assert_eq!(fx.registry.observer_count(), 0);
        assert!(fx.source.armed().is_empty());
    }

    #[test]
    fn test_missing_and_file_paths() {
        let fx = Fixture::new();
        let err = fx.registry.ensure_monitored(&fx.path("missing"), &listener()).unwrap_err();
        assert!(matches!(err, WatchError::NoSuchEntry(_)));

        fs::write(fx.temp.path().join("file"), "x").unwrap();
        let err = fx.registry.ensure_monitored(&fx.path("file"), &listener()).unwrap_err();
        assert!(matches!(err, WatchError::NotDirectory(_)));
        assert_eq!(fx.registry.observer_count(), 0);
    }

    #[test]
    fn test_structural_follow_up() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();
        let id = fx.id_of(&root);

        let c = fx.mkdir("D/c");
        fx.registry.apply(child_event(id, EventKind::Created, "c", true));
        assert!(fx.registry.has_observer(&c));

        fs::remove_dir(fx.temp.path().join("D/c")).unwrap();
        fx.registry.apply(child_event(id, EventKind::Deleted, "c", true));
        assert!(!fx.registry.has_observer(&c));
        assert_eq!(fx.registry.observer_count(), 1);
    }

    #[test]
    fn test_moved_in_directory_is_watched() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();
        let id = fx.id_of(&root);

        let moved = fx.mkdir("D/moved");
        fx.registry.apply(child_event(id, EventKind::MovedIn, "moved", true));
        assert!(fx.registry.has_observer(&moved));
        fx.registry.apply(child_event(id, EventKind::MovedOut, "moved", true));
        assert!(!fx.registry.has_observer(&moved));
    }

    #[test]
    fn test_child_event_delivered_to_parent_listeners() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        let l = listener();
        fx.registry.ensure_monitored(&root, &l).unwrap();

        let deliveries = fx
            .registry
            .apply(child_event(fx.id_of(&a), EventKind::Created, "photo.jpg", false));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].kind, EventKind::Created);
        assert_eq!(deliveries[0].path, fx.path("D/a/photo.jpg"));
        assert_eq!(deliveries[0].subscription, root);
        assert!(deliveries[0].listeners.contains(&l));
    }

    #[test]
    fn test_event_delivered_to_nearest_monitored_path() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();
        let own = listener();
        fx.registry.ensure_monitored(&a, &own).unwrap();

        let deliveries = fx
            .registry
            .apply(child_event(fx.id_of(&a), EventKind::Created, "x", false));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subscription, a);
        assert_eq!(deliveries[0].path, fx.path("D/a/x"));
        assert!(deliveries[0].listeners.contains(&own));

        // Once D/a is child-only again, its events go back to D.
        fx.registry.release(&a, &own);
        let deliveries = fx
            .registry
            .apply(child_event(fx.id_of(&a), EventKind::Created, "y", false));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subscription, root);
    }

    #[test]
    fn test_rename_inside_monitored_parent_keeps_child_watch() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        let own = listener();
        fx.registry.ensure_monitored(&root, &listener()).unwrap();
        fx.registry.ensure_monitored(&a, &own).unwrap();
        let root_id = fx.id_of(&root);
        let a_id = fx.id_of(&a);

        fs::rename(fx.temp.path().join("D/a"), fx.temp.path().join("D/b")).unwrap();
        let b = fx.path("D/b");
        fx.registry.apply(child_event(root_id, EventKind::MovedOut, "a", true));
        fx.registry.apply(child_event(root_id, EventKind::MovedIn, "b", true));
        let deliveries = fx.registry.apply(
            RawEvent {
                observer: a_id,
                change: RawChange::SelfMoved,
            }
            .into(),
        );

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].kind, EventKind::MovedOut);
        assert_eq!(deliveries[0].path, a);
        assert!(deliveries[0].listeners.contains(&own));

        assert!(fx.registry.has_observer(&b));
        assert!(!fx.registry.is_monitored(&a));
        assert!(!fx.registry.is_subscribed(&a, &own));
        assert_eq!(fx.registry.observer_count(), 2);
        assert!(fx.source.removed().is_empty());
        let snapshot = fx.registry.snapshot();
        let entry = snapshot.find(&b).unwrap();
        assert_eq!(entry.kind, EntryKind::ChildOnly);
        assert_eq!(entry.paths.len(), 1);
        assert_eq!(entry.ref_count, 1);
    }

    #[test]
    fn test_moved_away_directory_is_torn_down() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let l = listener();
        fx.registry.ensure_monitored(&root, &l).unwrap();
        let id = fx.id_of(&root);

        fs::rename(fx.temp.path().join("D"), fx.temp.path().join("E")).unwrap();
        let deliveries = fx.registry.apply(
            RawEvent {
                observer: id,
                change: RawChange::SelfMoved,
            }
            .into(),
        );
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].kind, EventKind::MovedOut);
        assert_eq!(deliveries[0].path, root);
        assert_eq!(fx.registry.observer_count(), 0);
        assert_eq!(fx.source.removed(), vec![id]);
    }

    #[test]
    fn test_self_delete_notifies_and_tears_down() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let l = listener();
        fx.registry.ensure_monitored(&root, &l).unwrap();
        let id = fx.id_of(&root);

        let deliveries = fx.registry.apply(
            RawEvent {
                observer: id,
                change: RawChange::SelfDeleted,
            }
            .into(),
        );
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].kind, EventKind::Deleted);
        assert_eq!(deliveries[0].path, root);
        assert!(!fx.registry.has_observer(&root));
        assert_eq!(fx.source.removed(), vec![id]);

        // Late events for the retired observer are dropped.
        assert!(fx.registry.apply(child_event(id, EventKind::Created, "x", false)).is_empty());
    }

    #[test]
    fn test_child_teardown_allows_recreation() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let a = fx.mkdir("D/a");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();
        let root_id = fx.id_of(&root);
        let a_id = fx.id_of(&a);

        // The child's own deletion event arrives before the parent's.
        fx.registry.apply(
            RawEvent {
                observer: a_id,
                change: RawChange::SelfDeleted,
            }
            .into(),
        );
        assert!(!fx.registry.has_observer(&a));
        fx.registry.apply(child_event(root_id, EventKind::Deleted, "a", true));

        fx.registry.apply(child_event(root_id, EventKind::Created, "a", true));
        assert!(fx.registry.has_observer(&a));
        assert_eq!(fx.registry.snapshot().find(&a).unwrap().ref_count, 1);
    }

    #[test]
    fn test_stale_record_is_rebound() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        let l = listener();
        fx.registry.ensure_monitored(&root, &l).unwrap();
        let before = fx.registry.snapshot().entries[0].identity;

        fs::remove_dir(fx.temp.path().join("D")).unwrap();
        // Keep the old inode alive so the new directory cannot reuse it.
        let _keep = fx.mkdir("keep");
        fx.mkdir("D");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();

        let snapshot = fx.registry.snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert_ne!(snapshot.entries[0].identity, before);
        // The earlier registration carried over to the new node.
        assert_eq!(snapshot.entries[0].paths[0].listeners, 2);
        assert!(fx.registry.is_subscribed(&root, &l));
    }

    #[test]
    fn test_close_stops_everything() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/a");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();

        assert_eq!(fx.registry.close(), 2);
        assert!(fx.source.armed().is_empty());
        assert_eq!(fx.registry.close(), 0);
        assert!(fx.registry.is_closed());
        assert!(matches!(
            fx.registry.ensure_monitored(&root, &listener()),
            Err(WatchError::Closed)
        ));
    }

    #[test]
    fn test_snapshot_serializes() {
        let fx = Fixture::new();
        let root = fx.mkdir("D");
        fx.mkdir("D/a");
        fx.registry.ensure_monitored(&root, &listener()).unwrap();

        let json = serde_json::to_value(fx.registry.snapshot()).unwrap();
        let entries = json["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "monitored");
        assert_eq!(entries[1]["kind"], "child_only");
        assert_eq!(entries[1]["paths"][0]["child_refs"], 1);
    }

    #[test]
    fn test_overflow_produces_nothing() {
        let fx = Fixture::new();
        assert!(fx.registry.apply(SourceEvent::Overflow).is_empty());
    }
}
