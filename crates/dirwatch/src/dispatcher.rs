//! Event routing and delivery.
//!
//! [`EventDispatcher`] runs two threads:
//!
//! - **router** (`dirwatch-route`): drains the source channel, applies each
//!   event to the [`WatchRegistry`] under its write lock, and queues the
//!   resulting [`Delivery`]s.
//! - **delivery** (`dirwatch-deliver`): invokes listeners one at a time,
//!   outside any lock.
//!
//! Splitting the two keeps a slow listener from stalling bookkeeping, and
//! keeps listener code free to call back into the service. Deliveries keep
//! the order the source produced them in.
//!
//! A listener unregistered after an event was routed but before it was
//! delivered does not receive it.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::registry::{Delivery, WatchRegistry};
use crate::source::EventStream;

/// Router and delivery threads of one watch service.
#[derive(Debug)]
pub struct EventDispatcher {
    router: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    /// Spawns both threads.
    ///
    /// They exit once every sender of `events` has been dropped, which
    /// happens when the source shuts down.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if either thread cannot be created.
    pub fn start(registry: Arc<WatchRegistry>, mut events: EventStream) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        let router_registry = Arc::clone(&registry);
        let router = thread::Builder::new()
            .name("dirwatch-route".to_owned())
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    trace!(?event, "Routing source event");
                    for delivery in router_registry.apply(event) {
                        if tx.send(delivery).is_err() {
                            return;
                        }
                    }
                }
                debug!("Router stopped");
            })?;

        let delivery = thread::Builder::new()
            .name("dirwatch-deliver".to_owned())
            .spawn(move || {
                while let Some(delivery) = rx.blocking_recv() {
                    deliver(&registry, &delivery);
                }
                debug!("Delivery stopped");
            })?;

        Ok(Self {
            router: Some(router),
            delivery: Some(delivery),
        })
    }

    /// Waits for both threads to finish.
    ///
    /// A thread never joins itself: when called from listener code the
    /// delivery thread is left to finish on its own.
    pub fn join(&mut self) {
        for handle in [self.router.take(), self.delivery.take()].into_iter().flatten() {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
    }
}

fn deliver(registry: &WatchRegistry, delivery: &Delivery) {
    for listener in &delivery.listeners {
        if !registry.is_subscribed(&delivery.subscription, listener) {
            trace!(path = %delivery.path, "Listener left before delivery");
            continue;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            listener.notify(delivery.kind, &delivery.path);
        }));
        if let Err(payload) = result {
            error!(
                kind = %delivery.kind,
                path = %delivery.path,
                panic = panic_message(payload.as_ref()),
                "Listener panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}
