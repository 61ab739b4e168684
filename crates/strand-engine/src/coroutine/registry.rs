//! Registry of coroutines started by the bridge

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, Payload};
use crate::future::Rejecter;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Settles a coroutine's own future with the type-erased return value
pub type ResolveFn = Arc<dyn Fn(Payload) -> Result<()> + Send + Sync>;

/// Everything needed to finish a managed coroutine
///
/// `resolve` and `reject` both close over the coroutine's own future.
#[derive(Clone)]
pub struct Record {
    /// The coroutine itself
    pub fiber: Fiber,
    /// Fulfills the own future with the body's return value
    pub resolve: ResolveFn,
    /// Rejects the own future
    pub reject: Rejecter,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record").field("fiber", &self.fiber).finish()
    }
}

/// Map from coroutine identity to its record
///
/// A record exists from spawn until the coroutine's own future settles.
pub struct Registry {
    records: FxHashMap<FiberId, Record>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            records: FxHashMap::default(),
        }
    }

    /// Insert a record; an identity may only be registered once
    pub fn register(&mut self, id: FiberId, record: Record) -> Result<()> {
        if self.records.contains_key(&id) {
            return Err(Error::DuplicateCoroutine(id));
        }
        self.records.insert(id, record);
        Ok(())
    }

    /// Get a record by identity
    pub fn lookup(&self, id: FiberId) -> Option<Record> {
        self.records.get(&id).cloned()
    }

    /// Whether `id` has a live record
    pub fn contains(&self, id: FiberId) -> bool {
        self.records.contains_key(&id)
    }

    /// Remove a record; absent identities are ignored
    pub fn deregister(&mut self, id: FiberId) -> Option<Record> {
        self.records.remove(&id)
    }

    /// Remove every record (after a fork or an escape), handing them back
    pub fn reset_all(&mut self) -> Vec<Record> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    /// Get the number of live records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no coroutine is registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Future;
    use crate::reactor::EventLoop;

    fn record(event_loop: &EventLoop) -> (FiberId, Record) {
        let fiber = Fiber::new(|| Ok(()));
        let own: Future<()> = Future::pending(event_loop);
        let resolver = own.resolver();
        let record = Record {
            fiber: fiber.clone(),
            resolve: Arc::new(move |_: Payload| resolver.resolve(())),
            reject: own.rejecter(),
        };
        (fiber.id(), record)
    }

    #[test]
    fn test_registry_creation() {
        let registry = Registry::new();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let event_loop = EventLoop::new();
        let mut registry = Registry::new();
        let (id, rec) = record(&event_loop);

        registry.register(id, rec).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(id));
        assert_eq!(registry.lookup(id).unwrap().fiber.id(), id);

        // Lookup leaves the record in place
        assert!(registry.lookup(id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate() {
        let event_loop = EventLoop::new();
        let mut registry = Registry::new();
        let (id, rec) = record(&event_loop);

        registry.register(id, rec.clone()).unwrap();
        assert_eq!(registry.register(id, rec), Err(Error::DuplicateCoroutine(id)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister() {
        let event_loop = EventLoop::new();
        let mut registry = Registry::new();
        let (id, rec) = record(&event_loop);

        registry.register(id, rec).unwrap();
        assert!(registry.deregister(id).is_some());
        assert!(registry.lookup(id).is_none());
        assert!(registry.deregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reset_all() {
        let event_loop = EventLoop::new();
        let mut registry = Registry::new();
        for _ in 0..3 {
            let (id, rec) = record(&event_loop);
            registry.register(id, rec).unwrap();
        }
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.reset_all().len(), 3);
        assert!(registry.is_empty());
        assert!(registry.reset_all().is_empty());
    }

    #[test]
    fn test_record_resolves_own_future() {
        let event_loop = EventLoop::new();
        let own: Future<i32> = Future::pending(&event_loop);
        let resolver = own.resolver();
        let rec = Record {
            fiber: Fiber::new(|| Ok(0)),
            resolve: Arc::new(move |payload: Payload| {
                let value = payload
                    .downcast::<i32>()
                    .map_err(|_| Error::msg("unexpected return type"))?;
                resolver.resolve(*value)
            }),
            reject: own.rejecter(),
        };

        (rec.resolve)(Box::new(9)).unwrap();
        assert_eq!(own.status(), crate::future::Status::Fulfilled);
    }
}
