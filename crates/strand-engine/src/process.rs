//! Signal and fork bookkeeping
//!
//! Signal watchers live in the event loop; this module keeps the parallel
//! `id -> signal` table so the kernel can drop both on cancel. Fork handlers
//! are one-shot and run when the embedding process manager reports a fork.

use crate::error::{report_failure, Error, Result};
use crate::reactor::{CallbackId, EventLoop};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// One-shot fork handler
pub type ForkHandler = Box<dyn FnOnce() -> Result<()> + Send>;

struct ProcessShared {
    event_loop: EventLoop,
    signals: Mutex<FxHashMap<CallbackId, i32>>,
    fork_handlers: Mutex<Vec<ForkHandler>>,
}

/// Signal and fork subsystem bound to one event loop
#[derive(Clone)]
pub struct Process {
    shared: Arc<ProcessShared>,
}

/// Non-owning handle to a [`Process`]
#[derive(Clone)]
pub struct WeakProcess {
    shared: Weak<ProcessShared>,
}

impl WeakProcess {
    /// Get the process back if it is still alive
    pub fn upgrade(&self) -> Option<Process> {
        self.shared.upgrade().map(|shared| Process { shared })
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("signals", &self.shared.signals.lock().len())
            .field("fork_handlers", &self.shared.fork_handlers.lock().len())
            .finish()
    }
}

impl Process {
    /// Create a process subsystem registering watchers on `event_loop`
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            shared: Arc::new(ProcessShared {
                event_loop,
                signals: Mutex::new(FxHashMap::default()),
                fork_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get a non-owning handle
    pub fn downgrade(&self) -> WeakProcess {
        WeakProcess {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Watch `signal`; the watcher stays until cancelled
    pub fn on_signal(
        &self,
        signal: i32,
        callback: impl FnMut(i32) -> Result<()> + Send + 'static,
    ) -> CallbackId {
        let id = self.shared.event_loop.on_signal(signal, callback);
        self.shared.signals.lock().insert(id, signal);
        tracing::debug!(signal, id = %id, "signal watcher registered");
        id
    }

    /// Drop the bookkeeping for a signal watcher, returning its signal
    pub fn cancel_signal_event(&self, id: CallbackId) -> Option<i32> {
        self.shared.signals.lock().remove(&id)
    }

    /// Number of watchers recorded for `signal`
    pub fn signal_registrations(&self, signal: i32) -> usize {
        self.shared
            .signals
            .lock()
            .values()
            .filter(|&&watched| watched == signal)
            .count()
    }

    /// Drop bookkeeping for watchers the event loop no longer holds
    pub fn retain_live(&self) {
        let live = self.shared.event_loop.identifiers();
        self.shared.signals.lock().retain(|id, _| live.contains(id));
    }

    // ------------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------------

    /// Run `handler` once, on the next fork
    pub fn on_fork(&self, handler: impl FnOnce() -> Result<()> + Send + 'static) {
        self.shared.fork_handlers.lock().push(Box::new(handler));
    }

    /// Number of pending fork handlers
    pub fn fork_handlers(&self) -> usize {
        self.shared.fork_handlers.lock().len()
    }

    /// Run and drop every pending fork handler in registration order.
    ///
    /// Handlers registered while dispatching wait for the next fork. Failures
    /// are reported; an escape stops dispatch and is returned.
    pub fn dispatch_fork(&self) -> Result<()> {
        let handlers = std::mem::take(&mut *self.shared.fork_handlers.lock());
        tracing::debug!(handlers = handlers.len(), "dispatching fork handlers");

        for handler in handlers {
            match handler() {
                Ok(()) => {}
                Err(Error::Escape) => return Err(Error::Escape),
                Err(error) => report_failure(&error),
            }
        }
        Ok(())
    }
}
