//! Core path, configuration, and error types for dirwatch.
//!
//! This crate provides the value types shared by the watch engine and its
//! command-line front end:
//!
//! - [`WatchPath`], an absolute, normalized, UTF-8 path
//! - [`WatchConfig`] and [`Config`], serde-backed configuration
//! - [`PathError`] and [`ConfigError`]
//! - Type aliases for `FxHashMap`/`FxHashSet`

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod path;

pub use config::{Backend, Config, MIN_EVENT_BUFFER_SIZE, WatchConfig};
pub use error::{ConfigError, PathError};
pub use hash::{FxHashMap, FxHashSet, fx_hash_map};
pub use path::WatchPath;
