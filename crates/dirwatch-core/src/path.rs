//! Absolute, normalized filesystem paths.
//!
//! [`WatchPath`] is the path value used throughout the watch engine. It is
//! always absolute, never contains `.` or `..` segments, and never ends with a
//! separator (except for the root itself). Equality is structural, so two
//! `WatchPath`s compare equal exactly when their normalized strings match.
//!
//! Normalization is purely lexical: symlinks are not resolved. Two different
//! `WatchPath`s may therefore name the same physical directory; the engine
//! detects that case through node identities, not through paths.
//!
//! # Examples
//!
//! ```
//! use dirwatch_core::WatchPath;
//!
//! let path = WatchPath::new("/sdcard/./DCIM/../Music/").unwrap();
//! assert_eq!(path.as_str(), "/sdcard/Music");
//! assert_eq!(path.file_name(), Some("Music"));
//! assert!(path.starts_with(&WatchPath::new("/sdcard").unwrap()));
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::PathError;

/// An absolute, normalized, UTF-8 filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WatchPath(Utf8PathBuf);

impl WatchPath {
    /// Parses and normalizes a raw path string.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NotAbsolute`] if `raw` is not an absolute path.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        Self::normalize(Utf8Path::new(raw))
    }

    /// Converts a standard library path, rejecting non-UTF-8 paths.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::NonUtf8`] for paths that are not valid UTF-8 and
    /// [`PathError::NotAbsolute`] for relative paths.
    pub fn from_std(path: &Path) -> Result<Self, PathError> {
        let utf8 =
            Utf8Path::from_path(path).ok_or_else(|| PathError::NonUtf8(path.to_path_buf()))?;
        Self::normalize(utf8)
    }

    /// Returns the filesystem root, `/`.
    #[must_use]
    pub fn root() -> Self {
        Self(Utf8PathBuf::from("/"))
    }

    fn normalize(path: &Utf8Path) -> Result<Self, PathError> {
        if !path.has_root() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }

        let mut normalized = Utf8PathBuf::from("/");
        for component in path.components() {
            match component {
                Utf8Component::RootDir | Utf8Component::CurDir => {}
                Utf8Component::ParentDir => {
                    // `..` at the root stays at the root, as the kernel does.
                    normalized.pop();
                }
                Utf8Component::Normal(name) => normalized.push(name),
                Utf8Component::Prefix(_) => {
                    return Err(PathError::NotAbsolute(path.to_string()));
                }
            }
        }
        Ok(Self(normalized))
    }

    /// Returns the parent directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|parent| Self(parent.to_path_buf()))
    }

    /// Returns the final component, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    /// Returns the path of the immediate entry `name` inside this directory.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::InvalidName`] if `name` is empty, is `.` or `..`,
    /// or contains a separator or NUL byte.
    pub fn child(&self, name: &str) -> Result<Self, PathError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(PathError::InvalidName(name.to_owned()));
        }
        Ok(Self(self.0.join(name)))
    }

    /// Returns `true` if `ancestor` equals this path or is one of its
    /// ancestors. The comparison is per component, so `/data` is not an
    /// ancestor of `/database`.
    #[must_use]
    pub fn starts_with(&self, ancestor: &Self) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Returns `true` if this is the filesystem root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.as_str() == "/"
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the path as a camino path.
    #[must_use]
    pub fn as_utf8_path(&self) -> &Utf8Path {
        &self.0
    }

    /// Returns the path as a standard library path, for filesystem calls.
    #[must_use]
    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for WatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WatchPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl TryFrom<Utf8PathBuf> for WatchPath {
    type Error = PathError;

    fn try_from(value: Utf8PathBuf) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<WatchPath> for String {
    fn from(value: WatchPath) -> Self {
        value.0.into_string()
    }
}

impl AsRef<Path> for WatchPath {
    fn as_ref(&self) -> &Path {
        self.as_std_path()
    }
}

impl AsRef<Utf8Path> for WatchPath {
    fn as_ref(&self) -> &Utf8Path {
        &self.0
    }
}
