//! Event subscription and emission
//!
//! A small component owned by each `Client` and each `Exchange`: a mapping
//! from event kind to the ordered list of subscribers for that kind.
//! Handlers run on whichever thread emits, usually the connection's read
//! loop, so they must be `Send + Sync`.

use super::lock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// An emittable event that knows its own kind
pub trait Event {
    /// Discriminant used for subscription
    type Kind: Copy + Eq + Hash;

    /// Kind of this event
    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscriber lists keyed by event kind
pub struct Emitter<E: Event> {
    handlers: Mutex<HashMap<E::Kind, Vec<Handler<E>>>>,
}

impl<E: Event> Emitter<E> {
    /// Create an emitter with no subscribers
    pub fn new() -> Self {
        Emitter {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one kind of event
    pub fn on<F>(&self, kind: E::Kind, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut handlers = lock(&self.handlers);
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Whether anyone listens for this kind
    pub fn has_subscribers(&self, kind: E::Kind) -> bool {
        let handlers = lock(&self.handlers);
        handlers.get(&kind).map_or(false, |list| !list.is_empty())
    }

    /// Invoke every subscriber of the event's kind in subscription order
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe
    /// further handlers without deadlocking. Returns how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = {
            let handlers = lock(&self.handlers);
            match handlers.get(&event.kind()) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}
