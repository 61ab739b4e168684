//! Event loop
//!
//! [`EventLoop`] is the reactor the kernel drives. It wraps a swappable
//! [`Driver`] (the registration table) and runs ticks on whichever context
//! drives it, which is always the root context except for the synchronous
//! flush performed during escape handling.
//!
//! A tick runs, in order: deferred closures queued before the tick, pending
//! signal deliveries, then due timers by deadline. Callbacks run with no lock
//! held, so they may register, cancel, resume fibers or settle futures.

mod driver;
mod suspension;

pub use driver::{
    Callback, CallbackId, CallbackType, Dispatch, Driver, DriverFactory, OnceCallback,
    Registration, RepeatCallback, SignalCallback, TimerDriver,
};
pub use suspension::Suspension;

use crate::defaults::DEFAULT_MAX_IDLE;
use crate::error::{report_failure, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct LoopShared {
    driver: Mutex<Box<dyn Driver>>,
    /// Wakes a blocked loop on registration or signal delivery
    notify: Condvar,
    factory: DriverFactory,
    max_idle_us: AtomicU64,
}

/// Clonable handle to the reactor
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let driver = self.shared.driver.lock();
        f.debug_struct("EventLoop")
            .field("driver", &driver.name())
            .field("registrations", &driver.identifiers().len())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Event loop backed by the default [`TimerDriver`]
    pub fn new() -> Self {
        Self::with_factory(DriverFactory::default())
    }

    /// Event loop whose drivers come from `factory`
    pub fn with_factory(factory: DriverFactory) -> Self {
        let driver = factory.create();
        Self {
            shared: Arc::new(LoopShared {
                driver: Mutex::new(driver),
                notify: Condvar::new(),
                factory,
                max_idle_us: AtomicU64::new(DEFAULT_MAX_IDLE.as_micros() as u64),
            }),
        }
    }

    /// Suspension handle for the calling context: a fiber suspension inside
    /// a fiber, a root suspension otherwise
    pub fn suspension(&self) -> Suspension {
        Suspension::for_current(self.clone())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    fn register(&self, registration: Registration) -> CallbackId {
        let id = CallbackId::next();
        self.shared.driver.lock().register(id, registration);
        self.shared.notify.notify_all();
        id
    }

    /// Run `callback` once on the next tick
    pub fn defer(&self, callback: impl FnOnce() -> Result<()> + Send + 'static) -> CallbackId {
        self.register(Registration::Defer(Box::new(callback)))
    }

    /// Run `callback` once after `after`
    pub fn delay(
        &self,
        after: Duration,
        callback: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> CallbackId {
        self.register(Registration::Delay {
            deadline: Instant::now() + after,
            callback: Box::new(callback),
        })
    }

    /// Run `callback` every `interval` until cancelled
    pub fn repeat(
        &self,
        interval: Duration,
        callback: impl FnMut(CallbackId) -> Result<()> + Send + 'static,
    ) -> CallbackId {
        self.register(Registration::Repeat {
            interval,
            callback: Box::new(callback),
        })
    }

    /// Run `callback` on every delivery of `signal`
    pub fn on_signal(
        &self,
        signal: i32,
        callback: impl FnMut(i32) -> Result<()> + Send + 'static,
    ) -> CallbackId {
        self.register(Registration::Signal {
            signal,
            callback: Box::new(callback),
        })
    }

    /// Queue one delivery of `signal`; safe to call from any thread
    pub fn raise_signal(&self, signal: i32) {
        self.shared.driver.lock().raise_signal(signal);
        self.shared.notify.notify_all();
    }

    /// Remove a registration; unknown ids are ignored
    pub fn cancel(&self, id: CallbackId) {
        self.shared.driver.lock().cancel(id);
    }

    /// Kind of a registration
    pub fn callback_type(&self, id: CallbackId) -> Option<CallbackType> {
        self.shared.driver.lock().callback_type(id)
    }

    /// All live registration ids
    pub fn identifiers(&self) -> Vec<CallbackId> {
        self.shared.driver.lock().identifiers()
    }

    /// Whether no registration is left
    pub fn is_idle(&self) -> bool {
        self.shared.driver.lock().identifiers().is_empty()
    }

    // ------------------------------------------------------------------------
    // Driver management
    // ------------------------------------------------------------------------

    /// Name of the installed driver
    pub fn driver_name(&self) -> &'static str {
        self.shared.driver.lock().name()
    }

    /// Install `driver`, returning the previous one
    pub fn set_driver(&self, driver: Box<dyn Driver>) -> Box<dyn Driver> {
        let previous = std::mem::replace(&mut *self.shared.driver.lock(), driver);
        self.shared.notify.notify_all();
        previous
    }

    /// Install a fresh driver from the factory, returning the previous one
    pub fn replace_driver(&self) -> Box<dyn Driver> {
        self.set_driver(self.shared.factory.create())
    }

    /// Stop the installed driver
    pub fn stop(&self) {
        self.shared.driver.lock().stop();
        self.shared.notify.notify_all();
    }

    /// Whether the installed driver was stopped
    pub fn is_stopped(&self) -> bool {
        self.shared.driver.lock().is_stopped()
    }

    /// Idle cap for blocking waits
    pub fn max_idle(&self) -> Duration {
        Duration::from_micros(self.shared.max_idle_us.load(Ordering::Relaxed))
    }

    /// Set the idle cap for blocking waits
    pub fn set_max_idle(&self, max_idle: Duration) {
        self.shared
            .max_idle_us
            .store(max_idle.as_micros() as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Run one tick. Returns how many callbacks ran.
    ///
    /// Callback failures are reported and swallowed, except the escape
    /// signal, which stops the tick and is returned.
    pub fn tick(&self) -> Result<usize> {
        let now = Instant::now();
        let mut ready = self.shared.driver.lock().take_ready(now).into_iter();
        let mut ran = 0;

        while let Some(dispatch) = ready.next() {
            let Dispatch {
                id,
                signal,
                callback,
            } = dispatch;

            {
                let mut driver = self.shared.driver.lock();
                if !driver.contains(id) {
                    // Cancelled by an earlier callback of this tick
                    continue;
                }
                if matches!(callback, Callback::Once(_)) {
                    driver.complete(id);
                }
            }

            let (outcome, returned) = match callback {
                Callback::Once(f) => (f(), None),
                Callback::Repeat(mut f) => {
                    let outcome = f(id);
                    (outcome, Some(Callback::Repeat(f)))
                }
                Callback::Signal(mut f) => {
                    let outcome = f(signal.unwrap_or_default());
                    (outcome, Some(Callback::Signal(f)))
                }
            };
            ran += 1;

            if let Some(callback) = returned {
                self.shared
                    .driver
                    .lock()
                    .rearm(id, callback, Instant::now());
            }

            match outcome {
                Ok(()) => {}
                Err(Error::Escape) => {
                    let mut driver = self.shared.driver.lock();
                    // Deferred closures go back to the front of the queue,
                    // so restore them last-first.
                    let (deferred, rest): (Vec<_>, Vec<_>) = ready.by_ref().partition(|d| {
                        driver.callback_type(d.id) == Some(CallbackType::Defer)
                    });
                    for dispatch in rest {
                        driver.restore(dispatch.id, dispatch.callback);
                    }
                    for dispatch in deferred.into_iter().rev() {
                        driver.restore(dispatch.id, dispatch.callback);
                    }
                    return Err(Error::Escape);
                }
                Err(error) => report_failure(&error),
            }
        }

        Ok(ran)
    }

    /// Run one tick of the installed driver even if it was stopped,
    /// reporting instead of returning every failure.
    pub fn run_driver_once(&self) {
        if let Err(error) = self.tick() {
            report_failure(&error);
        }
    }

    /// Run one synchronous tick of already-ready callbacks.
    pub fn flush(&self) {
        self.run_driver_once();
    }

    /// Drive ticks until `done` holds.
    ///
    /// Fails with `LoopExhausted` when no registration is left, and with
    /// `Escape` when a callback returned it.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> Result<()> {
        loop {
            if done() {
                return Ok(());
            }

            let ran = self.tick()?;
            if done() {
                return Ok(());
            }
            if ran > 0 {
                continue;
            }

            let mut driver = self.shared.driver.lock();
            if driver.identifiers().is_empty() {
                return Err(Error::LoopExhausted);
            }
            let now = Instant::now();
            if driver.has_ready(now) {
                continue;
            }
            let max_idle = self.max_idle();
            let wait = driver
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(max_idle)
                .min(max_idle);
            if !wait.is_zero() {
                self.shared.notify.wait_for(&mut driver, wait);
            }
        }
    }

    /// Drive ticks until no registration is left
    pub fn run(&self) -> Result<()> {
        match self.run_until(|| false) {
            Err(Error::LoopExhausted) => Ok(()),
            other => other,
        }
    }
}
