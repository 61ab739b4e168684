//! Suspension handles
//!
//! A suspension parks the context that created it until someone resumes it.
//! On the root context, suspending drives the event loop until the handle is
//! resumed; inside a fiber it simply yields the fiber.

use super::EventLoop;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, Payload, Resume};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct RootSlot {
    value: Option<Resume>,
    resumed: bool,
}

#[derive(Clone)]
enum Kind {
    Root {
        slot: Arc<Mutex<RootSlot>>,
        event_loop: EventLoop,
    },
    Fiber(Fiber),
}

/// One-shot park/unpark handle for the context that created it
#[derive(Clone)]
pub struct Suspension {
    kind: Kind,
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Root { slot, .. } => f
                .debug_struct("Suspension::Root")
                .field("resumed", &slot.lock().resumed)
                .finish(),
            Kind::Fiber(fiber) => f.debug_tuple("Suspension::Fiber").field(&fiber.id()).finish(),
        }
    }
}

impl Suspension {
    pub(crate) fn for_current(event_loop: EventLoop) -> Self {
        let kind = match Fiber::current() {
            Some(fiber) => Kind::Fiber(fiber),
            None => Kind::Root {
                slot: Arc::new(Mutex::new(RootSlot::default())),
                event_loop,
            },
        };
        Self { kind }
    }

    /// Whether this handle parks the root context
    pub fn is_root(&self) -> bool {
        matches!(self.kind, Kind::Root { .. })
    }

    /// Park until resumed; returns the resume value or raises the resume failure.
    pub fn suspend(&self) -> Result<Payload> {
        match &self.kind {
            Kind::Root { slot, event_loop } => {
                event_loop.run_until(|| slot.lock().value.is_some())?;
                match slot.lock().value.take() {
                    Some(Resume::Value(value)) => Ok(value),
                    Some(Resume::Throw(error)) => Err(error),
                    None => Err(Error::Suspension("resumed without a value")),
                }
            }
            Kind::Fiber(fiber) => {
                if Fiber::current_id() != Some(fiber.id()) {
                    return Err(Error::Suspension("suspension belongs to another fiber"));
                }
                Fiber::suspend()
            }
        }
    }

    /// Unpark the owning context with `resume`.
    ///
    /// A root suspension may be resumed before it suspends, but only once.
    pub fn resume(&self, resume: Resume) -> Result<()> {
        match &self.kind {
            Kind::Root { slot, .. } => {
                let mut slot = slot.lock();
                if slot.resumed {
                    return Err(Error::Suspension("suspension already resumed"));
                }
                slot.resumed = true;
                slot.value = Some(resume);
                Ok(())
            }
            Kind::Fiber(fiber) => fiber.resume(resume),
        }
    }
}
