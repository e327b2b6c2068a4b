//! Fast hash map and hash set type aliases.
//!
//! The watch registry keeps several small indexes (path to entry, node to
//! entry, observer to entry) that are consulted on every raw event. These use
//! the Fx hash from `rustc-hash`, which is considerably cheaper than SipHash
//! for short path strings and integer keys. The keys come from the local
//! filesystem, so denial-of-service resistance is not needed.
//!
//! # Examples
//!
//! ```
//! use dirwatch_core::{FxHashMap, FxHashSet, fx_hash_map};
//!
//! let mut by_inode: FxHashMap<u64, &str> = fx_hash_map();
//! by_inode.insert(42, "/storage/emulated/0");
//!
//! let mut seen: FxHashSet<&str> = FxHashSet::default();
//! assert!(seen.insert("/sdcard"));
//! ```

/// A [`HashMap`](std::collections::HashMap) using the Fx hash algorithm.
pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// A [`HashSet`](std::collections::HashSet) using the Fx hash algorithm.
pub type FxHashSet<V> = rustc_hash::FxHashSet<V>;

/// Creates a new empty [`FxHashMap`].
#[inline]
#[must_use]
pub fn fx_hash_map<K, V>() -> FxHashMap<K, V> {
    FxHashMap::default()
}
