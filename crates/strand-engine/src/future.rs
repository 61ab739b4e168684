//! One-shot futures with continuation handlers
//!
//! A [`Future`] settles at most once, to a fulfilled [`Resolution`] or a
//! rejection [`Error`]. Handlers attached while it is pending run at
//! settlement, in attachment order, in the settling context. Handlers
//! attached after settlement are deferred to the next event loop tick.
//!
//! A future may be fulfilled with another future; `await` in the bridge
//! flattens such chains.

use crate::error::{report_failure, Error, Result};
use crate::reactor::EventLoop;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Settlement status
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Not settled yet
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with a failure
    Rejected,
}

/// What a future was fulfilled with
pub enum Resolution<T> {
    /// A plain value
    Value(T),
    /// Another future whose outcome stands in for this one
    Future(Future<T>),
}

impl<T: Clone> Clone for Resolution<T> {
    fn clone(&self) -> Self {
        match self {
            Resolution::Value(value) => Resolution::Value(value.clone()),
            Resolution::Future(future) => Resolution::Future(future.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Future(future) => f.debug_tuple("Future").field(&future.status()).finish(),
        }
    }
}

impl<T> Resolution<T> {
    /// The plain value, if this is not a chained future
    pub fn into_value(self) -> Option<T> {
        match self {
            Resolution::Value(value) => Some(value),
            Resolution::Future(_) => None,
        }
    }
}

/// Settled payload of a future
#[derive(Debug, Clone)]
pub enum Settled<T> {
    /// Fulfilled payload
    Fulfilled(Resolution<T>),
    /// Rejection cause
    Rejected(Error),
}

type FulfilledHandler<T> = Box<dyn FnOnce(Resolution<T>) -> Result<()> + Send>;
type RejectedHandler = Box<dyn FnOnce(Error) -> Result<()> + Send>;
type SettledHandler = Box<dyn FnOnce() -> Result<()> + Send>;

enum Continuation<T> {
    Fulfilled(FulfilledHandler<T>),
    Rejected(RejectedHandler),
    Settled(SettledHandler),
}

impl<T: Clone> Continuation<T> {
    /// Run this handler against `outcome` if it applies to it
    fn fire(self, outcome: &Settled<T>) -> Result<()> {
        match (self, outcome) {
            (Continuation::Fulfilled(f), Settled::Fulfilled(resolution)) => f(resolution.clone()),
            (Continuation::Rejected(f), Settled::Rejected(error)) => f(error.clone()),
            (Continuation::Settled(f), _) => f(),
            _ => Ok(()),
        }
    }
}

struct Inner<T> {
    outcome: Option<Settled<T>>,
    continuations: Vec<Continuation<T>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    event_loop: EventLoop,
}

/// One-shot settlement cell. Cloning shares the same cell.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("status", &self.status()).finish()
    }
}

impl<T> Future<T> {
    /// Current status
    pub fn status(&self) -> Status {
        match &self.shared.inner.lock().outcome {
            None => Status::Pending,
            Some(Settled::Fulfilled(_)) => Status::Fulfilled,
            Some(Settled::Rejected(_)) => Status::Rejected,
        }
    }

    /// Whether the future has not settled yet
    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// Event loop late handlers are deferred on
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// A pending future whose late handlers are deferred on `event_loop`
    pub fn pending(event_loop: &EventLoop) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    outcome: None,
                    continuations: Vec::new(),
                }),
                event_loop: event_loop.clone(),
            }),
        }
    }

    /// An already fulfilled future
    pub fn resolved(event_loop: &EventLoop, value: T) -> Self {
        let future = Self::pending(event_loop);
        future.shared.inner.lock().outcome = Some(Settled::Fulfilled(Resolution::Value(value)));
        future
    }

    /// An already rejected future
    pub fn rejected(event_loop: &EventLoop, error: Error) -> Self {
        let future = Self::pending(event_loop);
        future.shared.inner.lock().outcome = Some(Settled::Rejected(error));
        future
    }

    /// The settled payload, `None` while pending
    pub fn result(&self) -> Option<Settled<T>> {
        self.shared.inner.lock().outcome.clone()
    }

    /// Capability to fulfill this future
    pub fn resolver(&self) -> Resolver<T> {
        Resolver {
            future: self.clone(),
        }
    }

    /// Capability to reject this future
    pub fn rejecter(&self) -> Rejecter {
        Rejecter {
            sink: Arc::new(self.clone()),
        }
    }

    /// Run `handler` when fulfilled
    pub fn on_fulfilled(&self, handler: impl FnOnce(Resolution<T>) -> Result<()> + Send + 'static) {
        self.attach(Continuation::Fulfilled(Box::new(handler)));
    }

    /// Run `handler` when rejected
    pub fn on_rejected(&self, handler: impl FnOnce(Error) -> Result<()> + Send + 'static) {
        self.attach(Continuation::Rejected(Box::new(handler)));
    }

    /// Run `handler` on settlement, whatever the outcome
    pub fn on_settled(&self, handler: impl FnOnce() -> Result<()> + Send + 'static) {
        self.attach(Continuation::Settled(Box::new(handler)));
    }

    fn attach(&self, continuation: Continuation<T>) {
        let outcome = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                None => {
                    inner.continuations.push(continuation);
                    return;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        // Never re-enter the attaching call
        self.shared
            .event_loop
            .defer(move || continuation.fire(&outcome));
    }

    /// Settle once; later calls are no-ops. Handlers run in attachment
    /// order. A failing handler is reported and the rest still run; only
    /// the escape signal stops settlement and is returned.
    fn settle(&self, outcome: Settled<T>) -> Result<()> {
        let continuations = {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_some() {
                return Ok(());
            }
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.continuations)
        };

        for continuation in continuations {
            match continuation.fire(&outcome) {
                Ok(()) => {}
                Err(Error::Escape) => return Err(Error::Escape),
                Err(error) => report_failure(&error),
            }
        }
        Ok(())
    }
}

/// Fulfills a future
pub struct Resolver<T> {
    future: Future<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Fulfill with a value
    pub fn resolve(&self, value: T) -> Result<()> {
        self.future.settle(Settled::Fulfilled(Resolution::Value(value)))
    }

    /// Fulfill with another future standing in for the value
    pub fn resolve_with(&self, future: Future<T>) -> Result<()> {
        self.future.settle(Settled::Fulfilled(Resolution::Future(future)))
    }

    /// The future this resolver settles
    pub fn future(&self) -> &Future<T> {
        &self.future
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish()
    }
}

trait RejectSink: Send + Sync {
    fn reject(&self, error: Error) -> Result<()>;
}

impl<T: Clone + Send + 'static> RejectSink for Future<T> {
    fn reject(&self, error: Error) -> Result<()> {
        self.settle(Settled::Rejected(error))
    }
}

/// Rejects a future; independent of the future's value type
#[derive(Clone)]
pub struct Rejecter {
    sink: Arc<dyn RejectSink>,
}

impl Rejecter {
    /// Reject with `error`
    pub fn reject(&self, error: impl Into<Error>) -> Result<()> {
        self.sink.reject(error.into())
    }
}

impl fmt::Debug for Rejecter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejecter").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        (log, move |entry: &str| l.lock().push(entry.to_string()))
    }

    #[test]
    fn test_future_starts_pending() {
        let event_loop = EventLoop::new();
        let future: Future<i32> = Future::pending(&event_loop);
        assert_eq!(future.status(), Status::Pending);
        assert!(future.result().is_none());
    }

    #[test]
    fn test_settles_once() {
        let event_loop = EventLoop::new();
        let future = Future::pending(&event_loop);
        future.resolver().resolve(1).unwrap();
        future.resolver().resolve(2).unwrap();
        future.rejecter().reject("late").unwrap();
        assert_eq!(future.status(), Status::Fulfilled);
        match future.result() {
            Some(Settled::Fulfilled(Resolution::Value(v))) => assert_eq!(v, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_handlers_fire_in_attachment_order() {
        let event_loop = EventLoop::new();
        let future: Future<i32> = Future::pending(&event_loop);
        let (log, record) = recorder();

        let r = record.clone();
        future.on_fulfilled(move |res| {
            r(&format!("first {}", res.into_value().unwrap_or_default()));
            Ok(())
        });
        let r = record.clone();
        future.on_rejected(move |_| {
            r("rejected");
            Ok(())
        });
        let r = record.clone();
        future.on_settled(move || {
            r("settled");
            Ok(())
        });
        let r = record;
        future.on_fulfilled(move |_| {
            r("second");
            Ok(())
        });

        future.resolver().resolve(5).unwrap();
        assert_eq!(*log.lock(), vec!["first 5", "settled", "second"]);
    }

    #[test]
    fn test_rejection_handlers() {
        let event_loop = EventLoop::new();
        let future: Future<()> = Future::pending(&event_loop);
        let (log, record) = recorder();
        let r = record.clone();
        future.on_rejected(move |e| {
            r(&e.to_string());
            Ok(())
        });
        let r = record;
        future.on_fulfilled(move |_| {
            r("fulfilled");
            Ok(())
        });
        future.rejecter().reject("broken").unwrap();
        assert_eq!(future.status(), Status::Rejected);
        assert_eq!(*log.lock(), vec!["broken"]);
    }

    #[test]
    fn test_late_handler_waits_for_next_tick() {
        let event_loop = EventLoop::new();
        let future = Future::resolved(&event_loop, "ready");
        let (log, record) = recorder();
        future.on_fulfilled(move |res| {
            record(res.into_value().unwrap_or("none"));
            Ok(())
        });
        assert!(log.lock().is_empty());
        event_loop.tick().unwrap();
        assert_eq!(*log.lock(), vec!["ready"]);
    }

    #[test]
    fn test_handler_failure_does_not_skip_later_handlers() {
        let event_loop = EventLoop::new();
        let future: Future<i32> = Future::pending(&event_loop);
        let (log, record) = recorder();
        future.on_fulfilled(|_| Err(Error::msg("handler failed")));
        future.on_fulfilled(move |res| {
            record(&format!("after {}", res.into_value().unwrap_or_default()));
            Ok(())
        });
        assert_eq!(future.resolver().resolve(3), Ok(()));
        assert_eq!(*log.lock(), vec!["after 3"]);
    }

    #[test]
    fn test_escape_stops_settlement() {
        let event_loop = EventLoop::new();
        let future: Future<i32> = Future::pending(&event_loop);
        let (log, record) = recorder();
        future.on_settled(|| Err(Error::Escape));
        future.on_settled(move || {
            record("after");
            Ok(())
        });
        assert_eq!(future.resolver().resolve(1), Err(Error::Escape));
        assert_eq!(future.status(), Status::Fulfilled);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_resolve_with_future() {
        let event_loop = EventLoop::new();
        let inner = Future::resolved(&event_loop, 3);
        let outer = Future::pending(&event_loop);
        outer.resolver().resolve_with(inner).unwrap();
        match outer.result() {
            Some(Settled::Fulfilled(Resolution::Future(f))) => assert_eq!(f.status(), Status::Fulfilled),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejected_constructor() {
        let event_loop = EventLoop::new();
        let future: Future<u8> = Future::rejected(&event_loop, Error::msg("no"));
        assert_eq!(future.status(), Status::Rejected);
        assert!(matches!(future.result(), Some(Settled::Rejected(e)) if e == Error::msg("no")));
    }
}
