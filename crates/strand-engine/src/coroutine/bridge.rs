//! Coroutine/future bridge
//!
//! Starts managed coroutines, parks callers at `await` and `sleep`, and
//! settles each coroutine's own future when it terminates. Escape signals
//! are routed through [`Bridge::handle_escape`] and never rejected onto a
//! future.

use super::registry::{Record, Registry};
use crate::config::{EscapePolicy, KernelConfig};
use crate::error::{report_failure, Error, Result};
use crate::fiber::{Fiber, FiberId, Payload, Resume};
use crate::future::{Future, Rejecter, Resolution, Resolver, Settled};
use crate::process::Process;
use crate::reactor::EventLoop;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bridge between stackful coroutines and futures
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<Mutex<Registry>>,
    event_loop: EventLoop,
    config: Arc<KernelConfig>,
    halted: Arc<AtomicBool>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("registered", &self.registered())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl Bridge {
    /// Create a bridge with an empty registry
    pub fn new(event_loop: EventLoop, config: Arc<KernelConfig>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            event_loop,
            config,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identity of the executing coroutine, `None` on the root context
    pub fn current_identity(&self) -> Option<FiberId> {
        Fiber::current_id()
    }

    /// Whether the executing coroutine was started by this bridge and is
    /// still responsible for its own future
    pub fn is_managed(&self) -> bool {
        self.current_identity()
            .is_some_and(|id| self.registry.lock().contains(id))
    }

    /// Number of live registry records
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether an escape reached a boundary under [`EscapePolicy::Halt`]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear the registry on every fork. The handler re-arms itself since
    /// fork handlers are one-shot.
    pub fn install_fork_reset(&self, process: &Process) {
        let bridge = self.clone();
        let weak = process.downgrade();
        process.on_fork(move || {
            bridge.reset();
            tracing::debug!("coroutine registry reset after fork");
            if let Some(process) = weak.upgrade() {
                bridge.install_fork_reset(&process);
            }
            Ok(())
        });
    }

    /// Clear the registry and unwind every suspended coroutine it held
    fn reset(&self) {
        let records = self.registry.lock().reset_all();
        let current = self.current_identity();
        let abandoned = records
            .iter()
            .filter(|record| Some(record.fiber.id()) != current)
            .filter(|record| record.fiber.abandon())
            .count();
        if abandoned > 0 {
            tracing::debug!(abandoned, "unwound unreachable coroutines");
        }
    }

    // ------------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------------

    /// Start `body` as a managed coroutine and return its own future.
    ///
    /// `body` runs right away until it first suspends. It receives the
    /// resolver and rejecter of its own future and may settle it early.
    /// Fails only with the escape signal, when one surfaced while starting
    /// and escape handling passed it on.
    pub fn spawn<R, F>(&self, body: F) -> Result<Future<R>>
    where
        R: Clone + Send + 'static,
        F: FnOnce(Resolver<R>, Rejecter) -> Result<R> + Send + 'static,
    {
        let own: Future<R> = Future::pending(&self.event_loop);
        let (resolver, rejecter) = (own.resolver(), own.rejecter());

        let fiber = Fiber::with_stack(
            move || body(resolver, rejecter),
            self.config.effective_stack_size(),
            &self.config.thread_name,
        );
        let id = fiber.id();

        let resolver = own.resolver();
        let record = Record {
            fiber: fiber.clone(),
            resolve: Arc::new(move |payload: Payload| {
                let value = payload
                    .downcast::<R>()
                    .map_err(|_| Error::InvalidEndState("unexpected return type".to_string()))?;
                resolver.resolve(*value)
            }),
            reject: own.rejecter(),
        };

        // Registered before start so the first segment already sees itself as managed
        self.registry.lock().register(id, record.clone())?;
        tracing::debug!(coroutine = %id, "coroutine spawned");

        match fiber.start() {
            Ok(()) => {}
            Err(Error::Escape) => {
                self.registry.lock().deregister(id);
                return Err(self.handle_escape());
            }
            Err(error) => {
                self.registry.lock().deregister(id);
                tracing::debug!(coroutine = %id, error = %error, "coroutine failed while starting");
                record.reject.reject(error)?;
                return Ok(own);
            }
        }

        if fiber.is_terminated() {
            let settled = self.complete(&record);
            self.registry.lock().deregister(id);
            settled?;
            return Ok(own);
        }

        let registry = Arc::clone(&self.registry);
        own.on_settled(move || {
            registry.lock().deregister(id);
            Ok(())
        });
        Ok(own)
    }

    /// Resume a managed coroutine and settle its own future if that made it
    /// terminate
    fn drive(&self, record: &Record, resume: Resume) -> Result<()> {
        let id = record.fiber.id();
        match record.fiber.resume(resume) {
            Ok(()) => {}
            Err(Error::Escape) => {
                self.registry.lock().deregister(id);
                return Err(self.handle_escape());
            }
            Err(error) => {
                tracing::debug!(coroutine = %id, error = %error, "coroutine failed");
                return record.reject.reject(error);
            }
        }

        if record.fiber.is_terminated() {
            self.complete(record)
        } else {
            Ok(())
        }
    }

    /// Settle the own future of a terminated coroutine with its return value
    fn complete(&self, record: &Record) -> Result<()> {
        tracing::debug!(coroutine = %record.fiber.id(), "coroutine terminated");
        match record.fiber.take_return() {
            Ok(value) => (record.resolve)(value),
            Err(error) => record.reject.reject(error),
        }
    }

    // ------------------------------------------------------------------------
    // Await
    // ------------------------------------------------------------------------

    /// Wait for `future` and return its innermost value.
    ///
    /// Settled futures return right away. A pending future parks the caller:
    /// the root context drives the event loop until settlement, a foreign
    /// fiber is suspended and resumed once, and a managed coroutine is
    /// resumed by the settlement handlers, which also finish it off if it
    /// terminates.
    pub fn await_future<T>(&self, future: &Future<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        match future.result() {
            Some(Settled::Fulfilled(resolution)) => return self.unwrap_resolution(resolution),
            Some(Settled::Rejected(error)) => return Err(error),
            None => {}
        }

        let payload = match self.current_identity().and_then(|id| self.registry.lock().lookup(id)) {
            Some(record) => {
                let (bridge, on_value) = (self.clone(), record.clone());
                future.on_fulfilled(move |resolution| {
                    bridge.drive(&on_value, Resume::Value(Box::new(resolution)))
                });
                let (bridge, on_error) = (self.clone(), record);
                future.on_rejected(move |error| bridge.drive(&on_error, Resume::Throw(error)));

                tracing::trace!(coroutine = ?self.current_identity(), "awaiting in managed coroutine");
                Fiber::suspend()?
            }
            None => {
                let suspension = self.event_loop.suspension();
                let s = suspension.clone();
                future.on_fulfilled(move |resolution| s.resume(Resume::Value(Box::new(resolution))));
                let s = suspension.clone();
                future.on_rejected(move |error| s.resume(Resume::Throw(error)));

                tracing::trace!(root = suspension.is_root(), "awaiting on suspension");
                suspension.suspend()?
            }
        };

        let resolution = payload
            .downcast::<Resolution<T>>()
            .map_err(|_| Error::Suspension("resumed with an unexpected value"))?;
        self.unwrap_resolution(*resolution)
    }

    fn unwrap_resolution<T>(&self, resolution: Resolution<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        match resolution {
            Resolution::Value(value) => Ok(value),
            Resolution::Future(inner) => self.await_future(&inner),
        }
    }

    // ------------------------------------------------------------------------
    // Sleep
    // ------------------------------------------------------------------------

    /// Suspend only the calling context for `duration`
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let record = self
            .current_identity()
            .and_then(|id| self.registry.lock().lookup(id));

        let Some(record) = record else {
            let suspension = self.event_loop.suspension();
            let s = suspension.clone();
            self.event_loop
                .delay(duration, move || s.resume(Resume::empty()));
            suspension.suspend()?;
            return Ok(());
        };

        let bridge = self.clone();
        self.event_loop
            .delay(duration, move || bridge.drive(&record, Resume::empty()));

        // The timer resumes us; nobody is left to receive a failure of this call
        if let Err(error) = Fiber::suspend() {
            report_failure(&error);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Escape
    // ------------------------------------------------------------------------

    /// Dispatch an escape signal and return what the caller should keep
    /// unwinding with.
    ///
    /// Inside a managed coroutine the signal is passed on unchanged. On the
    /// root context or in a foreign fiber this is a boundary: the registry is
    /// cleared, ready callbacks are flushed once, and the process exits with
    /// status 0, or under [`EscapePolicy::Halt`] the bridge is marked halted.
    pub fn handle_escape(&self) -> Error {
        if self.is_managed() {
            tracing::trace!(coroutine = ?self.current_identity(), "escape passed to outer frame");
            return Error::Escape;
        }

        self.reset();
        self.event_loop.flush();

        match self.config.escape_policy {
            EscapePolicy::Exit => {
                tracing::info!("escape reached a boundary, exiting");
                std::process::exit(0)
            }
            EscapePolicy::Halt => {
                tracing::info!("escape reached a boundary, halting");
                self.halted.store(true, Ordering::SeqCst);
                Error::Escape
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;

    fn bridge() -> Bridge {
        Bridge::new(EventLoop::new(), Arc::new(KernelConfig::halting()))
    }

    #[test]
    fn test_root_is_not_managed() {
        let bridge = bridge();
        assert!(bridge.current_identity().is_none());
        assert!(!bridge.is_managed());
    }

    #[test]
    fn test_spawned_body_is_managed() {
        let bridge = bridge();
        let b = bridge.clone();
        let future = bridge
            .spawn(move |_, _| Ok((b.is_managed(), b.current_identity().is_some())))
            .unwrap();
        assert_eq!(future.result().and_then(|s| match s {
            Settled::Fulfilled(r) => r.into_value(),
            Settled::Rejected(_) => None,
        }), Some((true, true)));
    }

    #[test]
    fn test_synchronous_spawn_settles_and_cleans_up() {
        let bridge = bridge();
        let future = bridge.spawn(|_, _| Ok(7)).unwrap();
        assert_eq!(future.status(), Status::Fulfilled);
        assert_eq!(bridge.registered(), 0);
        assert_eq!(bridge.await_future(&future).unwrap(), 7);
    }

    #[test]
    fn test_failed_body_rejects() {
        let bridge = bridge();
        let future = bridge.spawn(|_, _| -> Result<()> { Err(Error::msg("bad")) }).unwrap();
        assert_eq!(future.status(), Status::Rejected);
        assert_eq!(bridge.await_future(&future), Err(Error::msg("bad")));
        assert_eq!(bridge.registered(), 0);
    }

    #[test]
    fn test_panicking_body_rejects() {
        let bridge = bridge();
        let future = bridge.spawn(|_, _| -> Result<()> { panic!("oops") }).unwrap();
        assert_eq!(
            bridge.await_future(&future),
            Err(Error::Panicked("oops".to_string()))
        );
    }

    #[test]
    fn test_await_pending_in_managed_coroutine() {
        let bridge = bridge();
        let inner: Future<i32> = Future::pending(&bridge.event_loop);
        let (b, awaited) = (bridge.clone(), inner.clone());
        let outer = bridge
            .spawn(move |_, _| Ok(b.await_future(&awaited)? + 1))
            .unwrap();

        assert!(outer.is_pending());
        assert_eq!(bridge.registered(), 1);

        inner.resolver().resolve(42).unwrap();
        assert_eq!(outer.status(), Status::Fulfilled);
        assert_eq!(bridge.await_future(&outer).unwrap(), 43);
        assert_eq!(bridge.registered(), 0);
    }

    #[test]
    fn test_rejection_raised_in_coroutine() {
        let bridge = bridge();
        let inner: Future<i32> = Future::pending(&bridge.event_loop);
        let (b, awaited) = (bridge.clone(), inner.clone());
        let outer = bridge
            .spawn(move |_, _| match b.await_future(&awaited) {
                Ok(_) => Ok("value"),
                Err(e) if e == Error::msg("denied") => Ok("caught"),
                Err(e) => Err(e),
            })
            .unwrap();

        inner.rejecter().reject("denied").unwrap();
        assert_eq!(bridge.await_future(&outer).unwrap(), "caught");
    }

    #[test]
    fn test_root_await_drives_loop() {
        let bridge = bridge();
        let future: Future<&'static str> = Future::pending(&bridge.event_loop);
        let resolver = future.resolver();
        bridge
            .event_loop
            .delay(Duration::from_millis(5), move || resolver.resolve("later"));
        assert_eq!(bridge.await_future(&future).unwrap(), "later");
    }

    #[test]
    fn test_root_await_without_work_is_exhausted() {
        let bridge = bridge();
        let future: Future<()> = Future::pending(&bridge.event_loop);
        assert_eq!(bridge.await_future(&future), Err(Error::LoopExhausted));
    }

    #[test]
    fn test_manual_completion_keeps_running() {
        let bridge = bridge();
        let ran_after = Arc::new(AtomicBool::new(false));
        let flag = ran_after.clone();
        let future = bridge
            .spawn(move |resolver, _| {
                resolver.resolve(1)?;
                flag.store(true, Ordering::SeqCst);
                Ok(2)
            })
            .unwrap();
        assert!(ran_after.load(Ordering::SeqCst));
        // First settlement wins
        assert_eq!(bridge.await_future(&future).unwrap(), 1);
    }

    #[test]
    fn test_managed_sleep() {
        let bridge = bridge();
        let b = bridge.clone();
        let future = bridge
            .spawn(move |_, _| {
                b.sleep(Duration::from_millis(5))?;
                Ok("awake")
            })
            .unwrap();
        assert!(future.is_pending());
        assert_eq!(bridge.await_future(&future).unwrap(), "awake");
        assert_eq!(bridge.registered(), 0);
    }

    #[test]
    fn test_escape_at_root_halts() {
        let bridge = bridge();
        let result = bridge.spawn(|_, _| -> Result<()> { Err(Error::Escape) });
        assert_eq!(result.unwrap_err(), Error::Escape);
        assert!(bridge.is_halted());
        assert_eq!(bridge.registered(), 0);
    }

    #[test]
    fn test_fork_reset_rearms() {
        let bridge = bridge();
        let process = Process::new(bridge.event_loop.clone());
        bridge.install_fork_reset(&process);

        let inner: Future<()> = Future::pending(&bridge.event_loop);
        let (b, awaited) = (bridge.clone(), inner.clone());
        let _outer = bridge.spawn(move |_, _| b.await_future(&awaited)).unwrap();
        assert_eq!(bridge.registered(), 1);

        process.dispatch_fork().unwrap();
        assert_eq!(bridge.registered(), 0);
        assert_eq!(process.fork_handlers(), 1);
    }
}
