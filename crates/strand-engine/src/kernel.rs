//! Kernel: the entry point application code talks to
//!
//! The kernel owns the event loop, the process subsystem and the bridge,
//! and drives the loop from the root context in [`Kernel::run`]. Build one
//! per program (or per test) with [`Kernel::new`]; [`Kernel::global`] is the
//! lazily created process-wide instance.

use crate::config::KernelConfig;
use crate::coroutine::Bridge;
use crate::error::{report_failure, Error, Result};
use crate::fiber::{Fiber, Resume};
use crate::future::{Future, Rejecter, Resolver};
use crate::process::Process;
use crate::reactor::{CallbackId, CallbackType, EventLoop, Suspension};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Work handed to the root context and run inside [`Kernel::run`]
pub type RootAction = Box<dyn FnOnce() -> Result<()> + Send>;

static GLOBAL: Lazy<Kernel> = Lazy::new(|| Kernel::new(KernelConfig::from_env()));

struct KernelInner {
    config: Arc<KernelConfig>,
    event_loop: EventLoop,
    process: Process,
    bridge: Bridge,
    /// Suspension `run` is parked on, if it is running
    root: Mutex<Option<Suspension>>,
}

/// Coroutine kernel. Cloning shares the same kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("event_loop", &self.inner.event_loop)
            .field("bridge", &self.inner.bridge)
            .finish()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

/// Cancels the recurring registration it was handed to
#[derive(Clone)]
pub struct Canceller {
    kernel: Weak<KernelInner>,
    id: CallbackId,
}

impl Canceller {
    /// Id of the recurring registration
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Stop the recurrence; the current run finishes normally
    pub fn cancel(&self) {
        if let Some(inner) = self.kernel.upgrade() {
            Kernel { inner }.cancel(self.id);
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Canceller").field(&self.id).finish()
    }
}

impl Kernel {
    /// Create a kernel over a fresh event loop
    pub fn new(config: KernelConfig) -> Self {
        Self::with_event_loop(config, EventLoop::new())
    }

    /// Create a kernel driving `event_loop`
    pub fn with_event_loop(config: KernelConfig, event_loop: EventLoop) -> Self {
        event_loop.set_max_idle(config.max_idle);
        let config = Arc::new(config);
        let process = Process::new(event_loop.clone());
        let bridge = Bridge::new(event_loop.clone(), Arc::clone(&config));
        bridge.install_fork_reset(&process);

        Self {
            inner: Arc::new(KernelInner {
                config,
                event_loop,
                process,
                bridge,
                root: Mutex::new(None),
            }),
        }
    }

    /// Process-wide kernel, configured from the environment on first use
    pub fn global() -> &'static Kernel {
        &GLOBAL
    }

    /// Get the kernel configuration
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    /// Get the event loop
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Get the signal and fork subsystem
    pub fn process(&self) -> &Process {
        &self.inner.process
    }

    /// Get the coroutine bridge
    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    // ========================================================================
    // Coroutines and futures
    // ========================================================================

    /// Wait for `future`; see [`Bridge::await_future`]
    pub fn await_future<T>(&self, future: &Future<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        self.inner.bridge.await_future(future)
    }

    /// Start a managed coroutine; see [`Bridge::spawn`]
    pub fn spawn<R, F>(&self, body: F) -> Result<Future<R>>
    where
        R: Clone + Send + 'static,
        F: FnOnce(Resolver<R>, Rejecter) -> Result<R> + Send + 'static,
    {
        self.inner.bridge.spawn(body)
    }

    /// New future settled by `executor`, which runs right away.
    ///
    /// A failure returned by the executor rejects the future; an escape
    /// signal is returned instead.
    pub fn promise<T, F>(&self, executor: F) -> Result<Future<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Resolver<T>, Rejecter) -> Result<()>,
    {
        let future = Future::pending(&self.inner.event_loop);
        match executor(future.resolver(), future.rejecter()) {
            Ok(()) => {}
            Err(Error::Escape) => return Err(Error::Escape),
            Err(error) => future.rejecter().reject(error)?,
        }
        Ok(future)
    }

    /// Suspend the calling context for `duration`
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.inner.bridge.sleep(duration)
    }

    /// Number of coroutines whose own future has not settled
    pub fn registered_coroutines(&self) -> usize {
        self.inner.bridge.registered()
    }

    /// Whether an escape stopped the kernel
    pub fn is_halted(&self) -> bool {
        self.inner.bridge.is_halted()
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Run `callback` once after `after`
    pub fn delay(
        &self,
        callback: impl FnOnce() -> Result<()> + Send + 'static,
        after: Duration,
    ) -> CallbackId {
        self.inner.event_loop.delay(after, callback)
    }

    /// Run `callback` once on the next tick
    pub fn defer(&self, callback: impl FnOnce() -> Result<()> + Send + 'static) -> CallbackId {
        self.inner.event_loop.defer(callback)
    }

    /// Run `callback` every `interval`. The callback gets a [`Canceller`]
    /// bound to this registration.
    pub fn repeat(
        &self,
        mut callback: impl FnMut(&Canceller) -> Result<()> + Send + 'static,
        interval: Duration,
    ) -> CallbackId {
        let kernel = Arc::downgrade(&self.inner);
        self.inner.event_loop.repeat(interval, move |id| {
            let canceller = Canceller {
                kernel: kernel.clone(),
                id,
            };
            callback(&canceller)
        })
    }

    /// Cancel any registration; signal watchers also leave the process
    /// subsystem's table
    pub fn cancel(&self, id: CallbackId) {
        if self.inner.event_loop.callback_type(id) == Some(CallbackType::Signal) {
            self.inner.process.cancel_signal_event(id);
        }
        self.inner.event_loop.cancel(id);
    }

    /// Run `callback` on every delivery of `signal`
    pub fn on_signal(
        &self,
        signal: i32,
        callback: impl FnMut(i32) -> Result<()> + Send + 'static,
    ) -> CallbackId {
        self.inner.process.on_signal(signal, callback)
    }

    /// Deliver `signal` to its watchers on the next tick
    pub fn raise_signal(&self, signal: i32) {
        self.inner.event_loop.raise_signal(signal);
    }

    /// Run `handler` once in the child after the next fork
    pub fn on_fork(&self, handler: impl FnOnce() -> Result<()> + Send + 'static) {
        self.inner.process.on_fork(handler);
    }

    /// Report that this process is a freshly forked child: runs the pending
    /// fork handlers, which always include the coroutine registry reset
    pub fn forked(&self) -> Result<()> {
        tracing::debug!("fork reported");
        self.inner.process.dispatch_fork()
    }

    // ========================================================================
    // Driving the loop
    // ========================================================================

    /// Drive the event loop until no registration is left.
    ///
    /// `max_idle` caps every blocking wait. Root actions queued through
    /// [`handle_on_root`](Self::handle_on_root) run between passes. An
    /// escape that reaches the loop stops the kernel; under the halting
    /// policy this returns `Ok` with [`is_halted`](Self::is_halted) set.
    pub fn run(&self, max_idle: Duration) -> Result<()> {
        if Fiber::current_id().is_some() {
            return Err(Error::FiberState("the kernel only runs on the root context"));
        }
        let event_loop = &self.inner.event_loop;
        event_loop.set_max_idle(max_idle);

        loop {
            let suspension = event_loop.suspension();
            if event_loop.is_idle() {
                break;
            }

            *self.inner.root.lock() = Some(suspension.clone());
            let outcome = suspension.suspend();
            self.inner.root.lock().take();

            let outcome = match outcome {
                Ok(payload) => match payload.downcast::<RootAction>() {
                    Ok(action) => action(),
                    Err(_) => Ok(()),
                },
                Err(Error::LoopExhausted) => break,
                Err(error) => Err(error),
            };

            match outcome {
                Ok(()) => {}
                Err(Error::Escape) => {
                    if !self.is_halted() {
                        self.inner.bridge.handle_escape();
                    }
                    return Ok(());
                }
                Err(error) => report_failure(&error),
            }
        }

        tracing::debug!("event loop has no registrations left");
        Ok(())
    }

    /// [`run`](Self::run) with the configured idle cap
    pub fn run_default(&self) -> Result<()> {
        self.run(self.inner.config.max_idle)
    }

    /// Hand `action` to the root context.
    ///
    /// While [`run`](Self::run) is parked the action runs in its loop body.
    /// Otherwise it runs right away on the root context, or on the next tick
    /// when called from a coroutine.
    pub fn handle_on_root(&self, action: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        let action: RootAction = Box::new(action);
        let root = self.inner.root.lock().clone();
        match root {
            Some(suspension) => suspension.resume(Resume::Value(Box::new(action))),
            None if Fiber::current_id().is_none() => action(),
            None => {
                self.inner.event_loop.defer(action);
                Ok(())
            }
        }
    }

    /// Replace the reactor driver, typically in a freshly forked child.
    ///
    /// On the root context: stop the current driver, drain it once, install
    /// a fresh one and run `configure`. With `jump_to_root` the calling
    /// coroutine suspends afterwards.
    pub fn reinstall(&self, configure: Option<RootAction>, jump_to_root: bool) -> Result<()> {
        let kernel = self.clone();
        self.handle_on_root(move || {
            let event_loop = &kernel.inner.event_loop;
            event_loop.stop();
            event_loop.run_driver_once();
            let previous = event_loop.replace_driver();
            kernel.inner.process.retain_live();
            tracing::debug!(
                previous = previous.name(),
                driver = event_loop.driver_name(),
                "reactor driver reinstalled"
            );
            drop(previous);

            match configure {
                Some(configure) => configure(),
                None => Ok(()),
            }
        })?;

        if jump_to_root && Fiber::current_id().is_some() {
            Fiber::suspend()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::halting())
    }

    const IDLE: Duration = Duration::from_millis(10);

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Kernel::global(), Kernel::global()));
        assert!(Arc::ptr_eq(&Kernel::global().inner, &Kernel::global().clone().inner));
    }

    #[test]
    fn test_run_without_work_returns() {
        let kernel = kernel();
        kernel.run(IDLE).unwrap();
        assert!(kernel.event_loop().is_idle());
    }

    #[test]
    fn test_promise_executor() {
        let kernel = kernel();
        let future = kernel.promise(|resolver, _| resolver.resolve(5)).unwrap();
        assert_eq!(kernel.await_future(&future).unwrap(), 5);

        let failed: Future<i32> = kernel.promise(|_, _| Err(Error::msg("refused"))).unwrap();
        assert_eq!(kernel.await_future(&failed), Err(Error::msg("refused")));

        let escaped = kernel.promise::<i32, _>(|_, _| Err(Error::Escape));
        assert_eq!(escaped.unwrap_err(), Error::Escape);
    }

    #[test]
    fn test_delay_and_defer_order() {
        let kernel = kernel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        kernel.delay(
            move || {
                l.lock().push("delay");
                Ok(())
            },
            Duration::from_millis(2),
        );
        let l = log.clone();
        kernel.defer(move || {
            l.lock().push("defer");
            Ok(())
        });
        kernel.run(IDLE).unwrap();
        assert_eq!(*log.lock(), vec!["defer", "delay"]);
    }

    #[test]
    fn test_repeat_cancels_itself() {
        let kernel = kernel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = kernel.repeat(
            move |canceller| {
                if c.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    canceller.cancel();
                }
                Ok(())
            },
            Duration::from_millis(1),
        );
        assert_eq!(kernel.event_loop().callback_type(id), Some(CallbackType::Repeat));
        kernel.run(IDLE).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_signal_clears_both_tables() {
        let kernel = kernel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = kernel.on_signal(10, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(kernel.process().signal_registrations(10), 1);

        kernel.cancel(id);
        assert_eq!(kernel.process().signal_registrations(10), 0);
        assert!(kernel.event_loop().callback_type(id).is_none());

        kernel.raise_signal(10);
        kernel.run(IDLE).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handle_on_root_outside_run() {
        let kernel = kernel();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        kernel
            .handle_on_root(move || {
                r.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reinstall_from_callback() {
        let kernel = kernel();
        let configured = Arc::new(AtomicBool::new(false));
        kernel.delay(|| Ok(()), Duration::from_secs(3600));

        let (k, flag) = (kernel.clone(), configured.clone());
        kernel.defer(move || {
            let el = k.event_loop().clone();
            k.reinstall(
                Some(Box::new(move || {
                    el.defer(move || {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(())
                })),
                false,
            )
        });

        kernel.run(IDLE).unwrap();
        assert!(configured.load(Ordering::SeqCst));
        assert!(kernel.event_loop().is_idle());
    }

    #[test]
    fn test_forked_resets_registry() {
        let kernel = kernel();
        let pending: Future<()> = Future::pending(kernel.event_loop());
        let (k, awaited) = (kernel.clone(), pending.clone());
        kernel.spawn(move |_, _| k.await_future(&awaited)).unwrap();
        assert_eq!(kernel.registered_coroutines(), 1);

        kernel.forked().unwrap();
        assert_eq!(kernel.registered_coroutines(), 0);
        // The reset stays armed for the next fork
        assert_eq!(kernel.process().fork_handlers(), 1);
    }

    #[test]
    fn test_escape_from_callback_halts_run() {
        let kernel = kernel();
        kernel.defer(|| Err(Error::Escape));
        kernel.delay(|| Ok(()), Duration::from_secs(3600));
        kernel.run(IDLE).unwrap();
        assert!(kernel.is_halted());
    }

    #[test]
    fn test_run_rejected_inside_fiber() {
        let kernel = kernel();
        let k = kernel.clone();
        let future = kernel.spawn(move |_, _| k.run(IDLE)).unwrap();
        assert!(matches!(kernel.await_future(&future), Err(Error::FiberState(_))));
    }
}
