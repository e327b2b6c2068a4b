//! Configuration structures for the watch engine.
//!
//! - [`WatchConfig`] - engine settings (ignored roots, backend, buffers)
//! - [`Backend`] - which native watch primitive to use
//! - [`Config`] - root configuration, loadable from a JSON file
//!
//! All configuration types implement [`Default`]; a JSON file only needs to
//! mention the fields it changes.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::path::WatchPath;

/// Smallest accepted inotify read buffer.
///
/// A single event may carry a name of up to `NAME_MAX` bytes; a buffer that
/// cannot hold one makes every read fail with `EINVAL`.
pub const MIN_EVENT_BUFFER_SIZE: usize = 1024;

/// Native watch primitive used by a watch service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Backend {
    /// `inotify` on Linux and Android, `notify` elsewhere.
    #[default]
    Auto,
    /// One inotify instance per service, read on a dedicated thread.
    Inotify,
    /// The portable `notify` crate in non-recursive mode.
    Notify,
}

impl Backend {
    /// Resolves [`Backend::Auto`] to the concrete backend for this platform.
    #[must_use]
    pub const fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if cfg!(any(target_os = "linux", target_os = "android")) {
                    Self::Inotify
                } else {
                    Self::Notify
                }
            }
            other => other,
        }
    }
}

/// Configuration for a watch service.
///
/// # Examples
///
/// ```
/// use dirwatch_core::{Backend, WatchConfig};
///
/// let config = WatchConfig::default();
/// assert_eq!(config.ignored_roots.len(), 3);
/// assert_eq!(config.ignored_roots[0].as_str(), "/sys");
/// assert_eq!(config.backend, Backend::Auto);
/// assert!(config.watch_children);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Pseudo-filesystem roots that may never be watched, nor anything
    /// beneath them. They churn constantly and never need refreshing.
    pub ignored_roots: Vec<Utf8PathBuf>,

    /// Native watch primitive.
    pub backend: Backend,

    /// Size in bytes of the buffer raw inotify events are read into.
    pub event_buffer_size: usize,

    /// Whether monitoring a directory also observes its immediate child
    /// directories, so changes one level down are noticed.
    pub watch_children: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            ignored_roots: vec![
                Utf8PathBuf::from("/sys"),
                Utf8PathBuf::from("/proc"),
                Utf8PathBuf::from("/dev"),
            ],
            backend: Backend::Auto,
            event_buffer_size: 4096,
            watch_children: true,
        }
    }
}

impl WatchConfig {
    /// Returns the ignored roots as normalized paths.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] for a root that is not absolute.
    pub fn ignored_paths(&self) -> Result<Vec<WatchPath>, ConfigError> {
        self.ignored_roots
            .iter()
            .map(|root| {
                WatchPath::new(root.as_str()).map_err(|err| ConfigError::InvalidPath {
                    path: root.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    /// Checks every option.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] for relative ignored roots and
    /// [`ConfigError::InvalidOption`] for a buffer below
    /// [`MIN_EVENT_BUFFER_SIZE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ignored_paths()?;
        if self.event_buffer_size < MIN_EVENT_BUFFER_SIZE {
            return Err(ConfigError::InvalidOption {
                option: "event_buffer_size".to_owned(),
                reason: format!("must be at least {MIN_EVENT_BUFFER_SIZE} bytes"),
            });
        }
        Ok(())
    }
}

/// Root configuration for dirwatch.
///
/// # Examples
///
/// ```
/// use dirwatch_core::Config;
///
/// let config: Config = serde_json::from_str(r#"{"watch": {"watch_children": false}}"#).unwrap();
/// assert!(!config.watch.watch_children);
/// assert_eq!(config.watch.event_buffer_size, 4096);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watch engine configuration.
    pub watch: WatchConfig,
}

impl Config {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch.validate()
    }
}
