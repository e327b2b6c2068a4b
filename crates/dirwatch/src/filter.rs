//! Watchability filtering.
//!
//! Pseudo-filesystems such as `/proc`, `/sys`, and `/dev` emit a continuous
//! stream of meaningless modification events and never need refreshing.
//! [`PathFilter`] rejects them, and anything beneath them, before any native
//! resource is spent.
//!
//! # Examples
//!
//! ```
//! use dirwatch::PathFilter;
//! use dirwatch_core::WatchPath;
//!
//! let filter = PathFilter::default();
//! assert!(!filter.is_watchable(&WatchPath::new("/proc/1/fd").unwrap()));
//! assert!(filter.is_watchable(&WatchPath::new("/sdcard").unwrap()));
//! ```

use dirwatch_core::{ConfigError, WatchConfig, WatchPath};
use smallvec::SmallVec;

/// Decides whether a path may be watched at all.
///
/// The check is a pure, component-wise prefix comparison. No I/O is done,
/// so symlinks into an ignored root are not detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    ignored: SmallVec<[WatchPath; 4]>,
}

impl PathFilter {
    /// Creates a filter rejecting `ignored` roots and their descendants.
    #[must_use]
    pub fn new(ignored: impl IntoIterator<Item = WatchPath>) -> Self {
        Self {
            ignored: ignored.into_iter().collect(),
        }
    }

    /// Creates a filter that accepts every path.
    #[must_use]
    pub fn accept_all() -> Self {
        Self {
            ignored: SmallVec::new(),
        }
    }

    /// Creates a filter from the configured ignored roots.
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.ignored_paths()?))
    }

    /// Returns `false` if `path` equals or lies beneath an ignored root.
    #[inline]
    #[must_use]
    pub fn is_watchable(&self, path: &WatchPath) -> bool {
        !self.ignored.iter().any(|root| path.starts_with(root))
    }

    /// Returns the ignored roots.
    #[must_use]
    pub fn ignored(&self) -> &[WatchPath] {
        &self.ignored
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        // The default roots are constant absolute paths.
        Self::new(
            ["/sys", "/proc", "/dev"]
                .into_iter()
                .filter_map(|root| WatchPath::new(root).ok()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> WatchPath {
        WatchPath::new(raw).unwrap()
    }

    #[test]
    fn test_rejects_ignored_roots_and_descendants() {
        let filter = PathFilter::default();
        for raw in ["/sys", "/proc", "/dev", "/proc/self/fd", "/dev/log", "/sys/class/net"] {
            assert!(!filter.is_watchable(&path(raw)), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_accepts_other_paths() {
        let filter = PathFilter::default();
        for raw in ["/", "/sdcard", "/data/media", "/devices", "/system", "/procfs"] {
            assert!(filter.is_watchable(&path(raw)), "{raw} should be accepted");
        }
    }

    #[test]
    fn test_accept_all() {
        let filter = PathFilter::accept_all();
        assert!(filter.is_watchable(&path("/proc")));
        assert!(filter.ignored().is_empty());
    }

    #[test]
    fn test_from_config() {
        let config = WatchConfig {
            ignored_roots: vec!["/mnt/secure".into()],
            ..WatchConfig::default()
        };
        let filter = PathFilter::from_config(&config).unwrap();
        assert!(!filter.is_watchable(&path("/mnt/secure/asec")));
        assert!(filter.is_watchable(&path("/proc")));
    }

    #[test]
    fn test_default_matches_default_config() {
        let from_config = PathFilter::from_config(&WatchConfig::default()).unwrap();
        assert_eq!(PathFilter::default(), from_config);
    }
}
