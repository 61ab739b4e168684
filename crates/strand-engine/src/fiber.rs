//! Stackful coroutine primitive
//!
//! A [`Fiber`] runs its body on a dedicated stack and can suspend from any
//! depth of ordinary calls. Each fiber stack is backed by an OS thread, but a
//! baton (mutex + condvar) makes control transfer strictly synchronous:
//! `start`/`resume` hand the baton to the fiber and block until the fiber
//! suspends or terminates, so only one context ever executes at a time.
//!
//! The thread that creates fibers without being one is the *root context*.

use crate::defaults::{DEFAULT_STACK_SIZE, DEFAULT_THREAD_NAME};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Type-erased value carried across a suspension point
pub type Payload = Box<dyn Any + Send>;

type Body = Box<dyn FnOnce() -> Result<Payload> + Send>;

/// How a suspended fiber is resumed
pub enum Resume {
    /// Continue with a value returned from `Fiber::suspend`
    Value(Payload),
    /// Continue by raising a failure out of `Fiber::suspend`
    Throw(Error),
}

impl Resume {
    /// Resume with the unit value
    pub fn empty() -> Self {
        Resume::Value(Box::new(()))
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Value(_) => f.write_str("Resume::Value(..)"),
            Resume::Throw(e) => f.debug_tuple("Resume::Throw").field(e).finish(),
        }
    }
}

/// Unique identifier for a fiber, never reused within a process
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a FiberId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        FiberId(id)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// Created, body not started
    Created,
    /// Holding the baton
    Running,
    /// Parked in `Fiber::suspend`
    Suspended,
    /// Body returned, failed or was unwound
    Terminated,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Turn {
    Caller,
    Fiber,
}

struct Slot {
    state: FiberState,
    turn: Turn,
    inbox: Option<Resume>,
    outcome: Option<Result<Payload>>,
    abandoned: bool,
}

struct Baton {
    slot: Mutex<Slot>,
    handoff: Condvar,
}

struct FiberCore {
    id: FiberId,
    baton: Arc<Baton>,
    body: Mutex<Option<Body>>,
    stack_size: usize,
    thread_name: String,
}

impl Drop for FiberCore {
    fn drop(&mut self) {
        let mut slot = self.baton.slot.lock();
        if slot.state == FiberState::Suspended || slot.state == FiberState::Running {
            // Nobody can resume it anymore: let the stack unwind.
            slot.abandoned = true;
            self.baton.handoff.notify_all();
        }
    }
}

/// Panic payload used to unwind an abandoned fiber's stack
struct ForcedUnwind;

struct Current {
    id: FiberId,
    core: Weak<FiberCore>,
    baton: Arc<Baton>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Handle to a stackful coroutine. Cloning shares the same fiber.
#[derive(Clone)]
pub struct Fiber {
    core: Arc<FiberCore>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Fiber {
    /// Create a fiber with the default stack size
    pub fn new<F, R>(body: F) -> Self
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        Self::with_stack(body, DEFAULT_STACK_SIZE, DEFAULT_THREAD_NAME)
    }

    /// Create a fiber with an explicit stack size and thread name prefix
    pub fn with_stack<F, R>(body: F, stack_size: usize, thread_name: &str) -> Self
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let body: Body = Box::new(move || body().map(|value| Box::new(value) as Payload));
        Self {
            core: Arc::new(FiberCore {
                id: FiberId::next(),
                baton: Arc::new(Baton {
                    slot: Mutex::new(Slot {
                        state: FiberState::Created,
                        turn: Turn::Caller,
                        inbox: None,
                        outcome: None,
                        abandoned: false,
                    }),
                    handoff: Condvar::new(),
                }),
                body: Mutex::new(Some(body)),
                stack_size,
                thread_name: thread_name.to_string(),
            }),
        }
    }

    /// Get the fiber's unique ID
    pub fn id(&self) -> FiberId {
        self.core.id
    }

    /// Get the current state
    pub fn state(&self) -> FiberState {
        self.core.baton.slot.lock().state
    }

    /// Whether the body has finished
    pub fn is_terminated(&self) -> bool {
        self.state() == FiberState::Terminated
    }

    /// Handle to the fiber executing on this thread, if any
    pub fn current() -> Option<Fiber> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(|cur| cur.core.upgrade())
                .map(|core| Fiber { core })
        })
    }

    /// ID of the fiber executing on this thread, `None` on the root context
    pub fn current_id() -> Option<FiberId> {
        CURRENT.with(|current| current.borrow().as_ref().map(|cur| cur.id))
    }

    /// Run the body until it first suspends or terminates.
    ///
    /// Returns the body's failure if it terminated with one.
    pub fn start(&self) -> Result<()> {
        let body = self
            .core
            .body
            .lock()
            .take()
            .ok_or(Error::FiberState("fiber already started"))?;

        {
            let mut slot = self.core.baton.slot.lock();
            slot.state = FiberState::Running;
            slot.turn = Turn::Fiber;
        }

        let id = self.core.id;
        let core = Arc::downgrade(&self.core);
        let baton = Arc::clone(&self.core.baton);

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.core.thread_name, id.as_u64()))
            .stack_size(self.core.stack_size)
            .spawn(move || fiber_main(id, core, baton, body));

        if let Err(err) = spawned {
            let error = Error::Spawn(err.to_string());
            let mut slot = self.core.baton.slot.lock();
            slot.state = FiberState::Terminated;
            slot.turn = Turn::Caller;
            slot.outcome = Some(Err(error.clone()));
            return Err(error);
        }

        tracing::trace!(fiber = %id, "fiber started");
        self.wait_for_caller_turn()
    }

    /// Hand the baton back to a suspended fiber.
    ///
    /// Blocks until the fiber suspends again or terminates; returns the
    /// body's failure if it terminated with one.
    pub fn resume(&self, resume: Resume) -> Result<()> {
        {
            let mut slot = self.core.baton.slot.lock();
            match slot.state {
                FiberState::Suspended => {}
                FiberState::Created => return Err(Error::FiberState("cannot resume a fiber that has not started")),
                FiberState::Running => return Err(Error::FiberState("cannot resume a running fiber")),
                FiberState::Terminated => return Err(Error::FiberState("cannot resume a terminated fiber")),
            }
            slot.inbox = Some(resume);
            slot.state = FiberState::Running;
            slot.turn = Turn::Fiber;
            self.core.baton.handoff.notify_all();
        }

        tracing::trace!(fiber = %self.core.id, "fiber resumed");
        self.wait_for_caller_turn()
    }

    /// Suspend the calling fiber until someone resumes it.
    ///
    /// Returns the resume value, or the failure it was resumed with.
    pub fn suspend() -> Result<Payload> {
        let baton = CURRENT
            .with(|current| current.borrow().as_ref().map(|cur| Arc::clone(&cur.baton)))
            .ok_or(Error::FiberState("cannot suspend outside of a fiber"))?;

        let mut slot = baton.slot.lock();
        slot.state = FiberState::Suspended;
        slot.turn = Turn::Caller;
        baton.handoff.notify_all();

        while slot.turn == Turn::Caller {
            if slot.abandoned {
                drop(slot);
                panic::resume_unwind(Box::new(ForcedUnwind));
            }
            baton.handoff.wait(&mut slot);
        }

        slot.state = FiberState::Running;
        match slot.inbox.take() {
            Some(Resume::Value(value)) => Ok(value),
            Some(Resume::Throw(error)) => Err(error),
            None => Ok(Box::new(())),
        }
    }

    /// Take the value the body returned.
    ///
    /// Fails with `InvalidEndState` if the fiber has not terminated, ended
    /// with a failure, or the value was already taken.
    pub fn take_return(&self) -> Result<Payload> {
        let mut slot = self.core.baton.slot.lock();
        if slot.state != FiberState::Terminated {
            return Err(Error::InvalidEndState("coroutine has not terminated".to_string()));
        }
        match slot.outcome.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => {
                let message = format!("coroutine threw: {}", error);
                slot.outcome = Some(Err(error));
                Err(Error::InvalidEndState(message))
            }
            None => Err(Error::InvalidEndState("return value already taken".to_string())),
        }
    }

    /// Unwind a suspended fiber's stack and wait until it has terminated.
    ///
    /// Returns `false` and does nothing unless the fiber is suspended.
    /// Resuming it afterwards fails.
    pub fn abandon(&self) -> bool {
        let mut slot = self.core.baton.slot.lock();
        if slot.state != FiberState::Suspended {
            return false;
        }
        slot.abandoned = true;
        self.core.baton.handoff.notify_all();
        while slot.state != FiberState::Terminated {
            self.core.baton.handoff.wait(&mut slot);
        }
        tracing::trace!(fiber = %self.core.id, "fiber abandoned");
        true
    }

    /// Typed variant of [`take_return`](Self::take_return)
    pub fn take_return_as<R: 'static>(&self) -> Result<R> {
        let value = self.take_return()?;
        value
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::InvalidEndState("unexpected return type".to_string()))
    }

    fn wait_for_caller_turn(&self) -> Result<()> {
        let mut slot = self.core.baton.slot.lock();
        while slot.turn == Turn::Fiber {
            self.core.baton.handoff.wait(&mut slot);
        }
        match (&slot.state, &slot.outcome) {
            (FiberState::Terminated, Some(Err(error))) => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

fn fiber_main(id: FiberId, core: Weak<FiberCore>, baton: Arc<Baton>, body: Body) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(Current {
            id,
            core,
            baton: Arc::clone(&baton),
        })
    });

    let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) if payload.is::<ForcedUnwind>() => {
            Err(Error::InvalidEndState("coroutine was abandoned".to_string()))
        }
        Err(payload) => Err(Error::Panicked(panic_message(payload.as_ref()))),
    };

    CURRENT.with(|current| current.borrow_mut().take());

    match &outcome {
        Ok(_) => tracing::trace!(fiber = %id, "fiber returned"),
        Err(error) => tracing::trace!(fiber = %id, error = %error, "fiber failed"),
    }

    let mut slot = baton.slot.lock();
    slot.state = FiberState::Terminated;
    slot.outcome = Some(outcome);
    slot.turn = Turn::Caller;
    baton.handoff.notify_all();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_runs_to_completion() {
        let fiber = Fiber::new(|| Ok(21 * 2));
        assert_eq!(fiber.state(), FiberState::Created);
        fiber.start().unwrap();
        assert!(fiber.is_terminated());
        assert_eq!(fiber.take_return_as::<i32>().unwrap(), 42);
    }

    #[test]
    fn test_return_taken_once() {
        let fiber = Fiber::new(|| Ok("done"));
        fiber.start().unwrap();
        fiber.take_return().unwrap();
        assert!(matches!(fiber.take_return(), Err(Error::InvalidEndState(_))));
    }

    #[test]
    fn test_suspend_and_resume_with_value() {
        let fiber = Fiber::new(|| {
            let first = Fiber::suspend()?;
            let n = *first.downcast::<i32>().map_err(|_| Error::msg("bad payload"))?;
            Ok(n + 1)
        });

        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert!(matches!(fiber.take_return(), Err(Error::InvalidEndState(_))));

        fiber.resume(Resume::Value(Box::new(41))).unwrap();
        assert!(fiber.is_terminated());
        assert_eq!(fiber.take_return_as::<i32>().unwrap(), 42);
    }

    #[test]
    fn test_resume_with_throw() {
        let fiber = Fiber::new(|| match Fiber::suspend() {
            Ok(_) => Ok("value"),
            Err(e) => Ok(if e == Error::msg("nope") { "caught" } else { "other" }),
        });
        fiber.start().unwrap();
        fiber.resume(Resume::Throw(Error::msg("nope"))).unwrap();
        assert_eq!(fiber.take_return_as::<&str>().unwrap(), "caught");
    }

    #[test]
    fn test_failure_surfaces_from_resume() {
        let fiber = Fiber::new(|| -> Result<()> {
            Fiber::suspend()?;
            Err(Error::msg("late failure"))
        });
        fiber.start().unwrap();
        let err = fiber.resume(Resume::empty()).unwrap_err();
        assert_eq!(err, Error::msg("late failure"));
        assert!(fiber.is_terminated());
        assert!(matches!(fiber.take_return(), Err(Error::InvalidEndState(_))));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let fiber = Fiber::new(|| -> Result<()> { panic!("kaboom") });
        let err = fiber.start().unwrap_err();
        assert_eq!(err, Error::Panicked("kaboom".to_string()));
    }

    #[test]
    fn test_resume_misuse() {
        let fiber = Fiber::new(|| Ok(()));
        assert!(matches!(fiber.resume(Resume::empty()), Err(Error::FiberState(_))));
        fiber.start().unwrap();
        assert!(matches!(fiber.resume(Resume::empty()), Err(Error::FiberState(_))));
        assert!(matches!(fiber.start(), Err(Error::FiberState(_))));
    }

    #[test]
    fn test_suspend_outside_fiber() {
        assert!(matches!(Fiber::suspend(), Err(Error::FiberState(_))));
        assert!(Fiber::current().is_none());
        assert!(Fiber::current_id().is_none());
    }

    #[test]
    fn test_current_identity_inside_fiber() {
        let fiber = Fiber::new(|| {
            let me = Fiber::current().ok_or(Error::msg("no current fiber"))?;
            Ok((me.id(), Fiber::current_id()))
        });
        let id = fiber.id();
        fiber.start().unwrap();
        let (seen, current) = fiber.take_return_as::<(FiberId, Option<FiberId>)>().unwrap();
        assert_eq!(seen, id);
        assert_eq!(current, Some(id));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Fiber::new(|| Ok(()));
        let b = Fiber::new(|| Ok(()));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_nested_fibers() {
        let outer = Fiber::new(|| {
            let inner = Fiber::new(|| {
                Fiber::suspend()?;
                Ok(2)
            });
            inner.start()?;
            Fiber::suspend()?;
            inner.resume(Resume::empty())?;
            let two = inner.take_return_as::<i32>()?;
            Ok(two * 10)
        });
        outer.start().unwrap();
        assert_eq!(outer.state(), FiberState::Suspended);
        outer.resume(Resume::empty()).unwrap();
        assert_eq!(outer.take_return_as::<i32>().unwrap(), 20);
    }

    #[test]
    fn test_abandoned_fiber_unwinds() {
        use std::sync::atomic::AtomicBool;
        use std::time::{Duration, Instant};

        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Flag(Arc::clone(&dropped));
        let fiber = Fiber::new(move || {
            let _guard = guard;
            Fiber::suspend()?;
            Ok(())
        });
        fiber.start().unwrap();
        drop(fiber);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_abandon_unwinds_before_returning() {
        use std::sync::atomic::AtomicBool;

        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Flag(Arc::clone(&dropped));
        let fiber = Fiber::new(move || {
            let _guard = guard;
            Fiber::suspend()?;
            Ok(())
        });
        assert!(!fiber.abandon());
        fiber.start().unwrap();

        assert!(fiber.abandon());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(fiber.is_terminated());
        assert!(!fiber.abandon());
        assert!(matches!(fiber.resume(Resume::empty()), Err(Error::FiberState(_))));
    }
}
