//! Directory-change watch engine with shared, reference-counted native
//! watches.
//!
//! This crate lets many independent callers ask to be told when the
//! immediate contents of a directory change, while arming as few native
//! watches as possible.
//!
//! # Overview
//!
//! The dirwatch crate is designed to:
//!
//! - Share one native watch per physical directory, however many paths
//!   (bind mounts, symlinks) and callers reach it
//! - Also watch the immediate child directories of every monitored
//!   directory, and keep those child watches in sync as the tree changes
//! - Tear watches down as soon as nobody needs them
//! - Refuse pseudo-filesystems (`/proc`, `/sys`, `/dev`) up front
//! - Deliver notifications on a dedicated thread, isolated from listener
//!   panics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         WatchService                             │
//! │  register / unregister / is_monitored / has_observer / close     │
//! └───────────────┬──────────────────────────────────────────────────┘
//!                 │ write lock                    ▲ read lock
//!                 ▼                               │
//! ┌──────────────────────────────┐    ┌──────────────────────────────┐
//! │ WatchRegistry                │◄───│ router thread                │
//! │  entries by NodeIdentity     │    │  SourceEvent ─► Delivery     │
//! │  records by WatchPath        │    └──────────────▲───────────────┘
//! └───────────────┬──────────────┘                   │ unbounded channel
//!                 │ Observer::start / stop           │
//!                 ▼                                  │
//! ┌──────────────────────────────┐                   │
//! │ WatchSource                  │───────────────────┘
//! │  inotify │ notify            │
//! └──────────────────────────────┘
//!                                     delivery thread ─► Listener::on_event
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! dirwatch-cli ──► dirwatch ──► dirwatch-core
//! ```
//!
//! # Usage
//!
//! ## Watching a Directory
//!
//! ```no_run
//! use dirwatch::{WatchService, channel_listener};
//! use dirwatch_core::WatchPath;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = WatchService::create();
//!     let path = WatchPath::new("/storage/emulated/0/DCIM")?;
//!     let (listener, mut events) = channel_listener();
//!
//!     service.register(&path, &listener)?;
//!     while let Some(event) = events.recv().await {
//!         println!("{} {}", event.kind, event.path);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Sharing Across Callers
//!
//! ```no_run
//! use dirwatch::{EventKind, ListenerHandle, WatchService};
//! use dirwatch_core::WatchPath;
//!
//! # fn main() -> Result<(), dirwatch::WatchError> {
//! let service = WatchService::get();
//! let gallery = ListenerHandle::new(|kind: EventKind, path: &WatchPath| {
//!     println!("gallery: {kind} {path}");
//! });
//! let files = ListenerHandle::new(|kind: EventKind, path: &WatchPath| {
//!     println!("files: {kind} {path}");
//! });
//!
//! // Both paths name the same directory, so one native watch serves both.
//! service.register(&WatchPath::new("/sdcard/DCIM")?, &gallery)?;
//! service.register(&WatchPath::new("/storage/emulated/0/DCIM")?, &files)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! The crate uses [`WatchError`] for all error cases:
//!
//! ```
//! use dirwatch::WatchError;
//!
//! fn handle_watch_error(err: WatchError) {
//!     if err.is_recoverable() {
//!         // Fall back to polling this one path
//!         eprintln!("Cannot watch: {}", err);
//!     } else {
//!         eprintln!("Watch service failure: {}", err);
//!     }
//! }
//! ```
//!
//! # Guarantees and Limits
//!
//! - Notifications for one directory arrive in the order the kernel
//!   reported them; there is no ordering across directories.
//! - Events that happen before `register` returns may be missed.
//! - On queue overflow events are lost; a warning is logged and watches stay
//!   armed.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod filter;
pub mod identity;
pub mod observer;
pub mod registry;
pub mod service;
pub mod source;

// Re-export error types
pub use error::WatchError;

// Re-export event types
pub use events::{EventKind, Listener, ListenerHandle, WatchEvent, channel_listener};

// Re-export filter and identity types
pub use filter::PathFilter;
pub use identity::{NodeIdentity, identity_of};

// Re-export engine types
pub use observer::Observer;
pub use registry::{EntryKind, EntrySnapshot, PathSnapshot, RegistrySnapshot, WatchRegistry};
pub use service::WatchService;
pub use source::{ObserverId, WatchSource};
