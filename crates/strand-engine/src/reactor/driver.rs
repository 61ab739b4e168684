//! Reactor drivers: the registration table behind the event loop
//!
//! A driver owns every registration (deferred closures, one-shot and
//! repeating timers, signal watchers) and decides what is ready on a tick.
//! It never runs callbacks itself: [`take_ready`](Driver::take_ready) lends
//! them to the event loop, which invokes them with no lock held and hands
//! recurring ones back afterwards.

use crate::error::Result;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// One-shot callback (defer / delay)
pub type OnceCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Repeating callback, receives its own registration id
pub type RepeatCallback = Box<dyn FnMut(CallbackId) -> Result<()> + Send>;

/// Signal callback, receives the delivered signal number
pub type SignalCallback = Box<dyn FnMut(i32) -> Result<()> + Send>;

/// Identifier of a reactor registration, unique across drivers
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

impl CallbackId {
    pub(crate) fn next() -> Self {
        CallbackId(NEXT_CALLBACK_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Kind of a registration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackType {
    /// Runs once on the next tick
    Defer,
    /// Runs once after a delay
    Delay,
    /// Runs every interval until cancelled
    Repeat,
    /// Runs on every delivery of a signal
    Signal,
}

/// Callback body lent out by a driver
pub enum Callback {
    /// Defer or delay
    Once(OnceCallback),
    /// Repeat
    Repeat(RepeatCallback),
    /// Signal watcher
    Signal(SignalCallback),
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Once(_) => f.write_str("Callback::Once"),
            Callback::Repeat(_) => f.write_str("Callback::Repeat"),
            Callback::Signal(_) => f.write_str("Callback::Signal"),
        }
    }
}

/// A registration request handed to a driver
pub enum Registration {
    /// Next tick
    Defer(OnceCallback),
    /// Once at `deadline`
    Delay {
        /// When to fire
        deadline: Instant,
        /// What to run
        callback: OnceCallback,
    },
    /// Every `interval`, first at `now + interval`
    Repeat {
        /// Period between runs
        interval: Duration,
        /// What to run
        callback: RepeatCallback,
    },
    /// On delivery of `signal`
    Signal {
        /// Signal number
        signal: i32,
        /// What to run
        callback: SignalCallback,
    },
}

/// Work lent to the event loop for one invocation
#[derive(Debug)]
pub struct Dispatch {
    /// Registration the callback belongs to
    pub id: CallbackId,
    /// Signal number for signal watchers
    pub signal: Option<i32>,
    /// The callback itself
    pub callback: Callback,
}

/// Registration table and readiness source for the event loop
pub trait Driver: Send {
    /// Human-readable driver name
    fn name(&self) -> &'static str;

    /// Add a registration under `id`
    fn register(&mut self, id: CallbackId, registration: Registration);

    /// Remove a registration; returns whether it existed
    fn cancel(&mut self, id: CallbackId) -> bool;

    /// Whether `id` is still registered
    fn contains(&self, id: CallbackId) -> bool;

    /// Kind of the registration, if it exists
    fn callback_type(&self, id: CallbackId) -> Option<CallbackType>;

    /// All live registration ids, in registration order
    fn identifiers(&self) -> Vec<CallbackId>;

    /// Queue one delivery of `signal` to every watcher of it
    fn raise_signal(&mut self, signal: i32);

    /// Lend out everything ready at `now`: deferred closures queued before
    /// this call, pending signal deliveries, then due timers by deadline.
    fn take_ready(&mut self, now: Instant) -> Vec<Dispatch>;

    /// Drop a one-shot registration whose callback is about to run
    fn complete(&mut self, id: CallbackId);

    /// Take back a recurring callback after it ran at `now`
    fn rearm(&mut self, id: CallbackId, callback: Callback, now: Instant);

    /// Take back a callback that was lent out but never ran
    fn restore(&mut self, id: CallbackId, callback: Callback);

    /// Whether something would be ready at `now`
    fn has_ready(&self, now: Instant) -> bool;

    /// Earliest timer deadline
    fn next_deadline(&self) -> Option<Instant>;

    /// Mark the driver stopped
    fn stop(&mut self);

    /// Whether `stop` was called
    fn is_stopped(&self) -> bool;
}

/// Creates fresh drivers, e.g. when reinstalling after a fork
#[derive(Clone)]
pub struct DriverFactory {
    make: std::sync::Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>,
}

impl DriverFactory {
    /// Factory for a custom driver type
    pub fn new(make: impl Fn() -> Box<dyn Driver> + Send + Sync + 'static) -> Self {
        Self {
            make: std::sync::Arc::new(make),
        }
    }

    /// Build a new driver instance
    pub fn create(&self) -> Box<dyn Driver> {
        (self.make)()
    }
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::new(|| Box::new(TimerDriver::new()))
    }
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DriverFactory")
    }
}

// ============================================================================
// TimerDriver
// ============================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    Defer,
    Delay,
    Repeat(Duration),
    Signal(i32),
}

struct Entry {
    kind: Kind,
    /// `None` while lent out to the event loop
    callback: Option<Callback>,
    /// Generation of the live heap entry; older heap entries are stale
    armed: u64,
    /// Undelivered signals
    pending_signals: usize,
}

/// Heap entry for timers (min-heap by deadline, ties by arming order)
struct TimerEntry {
    deadline: Instant,
    generation: u64,
    id: CallbackId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

/// Heap size above which cancelling prunes stale timer entries
const COMPACT_THRESHOLD: usize = 64;

/// Default in-process driver: deferred queue, timer heap and signal queue
pub struct TimerDriver {
    entries: FxHashMap<CallbackId, Entry>,
    deferred: VecDeque<CallbackId>,
    timers: BinaryHeap<TimerEntry>,
    generation: u64,
    stopped: bool,
}

impl TimerDriver {
    /// Create an empty driver
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            deferred: VecDeque::new(),
            timers: BinaryHeap::new(),
            generation: 0,
            stopped: false,
        }
    }

    fn arm(&mut self, id: CallbackId, deadline: Instant) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.armed = generation;
            self.timers.push(TimerEntry {
                deadline,
                generation,
                id,
            });
        }
    }

    /// Drop heap entries whose registration is gone or was re-armed
    fn compact(&mut self) {
        let entries = &self.entries;
        self.timers.retain(|timer| {
            entries
                .get(&timer.id)
                .map_or(false, |entry| entry.armed == timer.generation)
        });
        self.deferred.retain(|id| entries.contains_key(id));
    }

    fn is_live(&self, timer: &TimerEntry) -> bool {
        self.entries
            .get(&timer.id)
            .map(|entry| entry.armed == timer.generation && entry.callback.is_some())
            .unwrap_or(false)
    }
}

impl Default for TimerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for TimerDriver {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn register(&mut self, id: CallbackId, registration: Registration) {
        match registration {
            Registration::Defer(callback) => {
                self.entries.insert(
                    id,
                    Entry {
                        kind: Kind::Defer,
                        callback: Some(Callback::Once(callback)),
                        armed: 0,
                        pending_signals: 0,
                    },
                );
                self.deferred.push_back(id);
            }
            Registration::Delay { deadline, callback } => {
                self.entries.insert(
                    id,
                    Entry {
                        kind: Kind::Delay,
                        callback: Some(Callback::Once(callback)),
                        armed: 0,
                        pending_signals: 0,
                    },
                );
                self.arm(id, deadline);
            }
            Registration::Repeat { interval, callback } => {
                self.entries.insert(
                    id,
                    Entry {
                        kind: Kind::Repeat(interval),
                        callback: Some(Callback::Repeat(callback)),
                        armed: 0,
                        pending_signals: 0,
                    },
                );
                self.arm(id, Instant::now() + interval);
            }
            Registration::Signal { signal, callback } => {
                self.entries.insert(
                    id,
                    Entry {
                        kind: Kind::Signal(signal),
                        callback: Some(Callback::Signal(callback)),
                        armed: 0,
                        pending_signals: 0,
                    },
                );
            }
        }
    }

    fn cancel(&mut self, id: CallbackId) -> bool {
        // Heap and deferred entries are skipped lazily once the entry is gone
        let removed = self.entries.remove(&id).is_some();
        if removed
            && self.timers.len() > COMPACT_THRESHOLD
            && self.timers.len() > 2 * self.entries.len()
        {
            self.compact();
        }
        removed
    }

    fn contains(&self, id: CallbackId) -> bool {
        self.entries.contains_key(&id)
    }

    fn callback_type(&self, id: CallbackId) -> Option<CallbackType> {
        self.entries.get(&id).map(|entry| match entry.kind {
            Kind::Defer => CallbackType::Defer,
            Kind::Delay => CallbackType::Delay,
            Kind::Repeat(_) => CallbackType::Repeat,
            Kind::Signal(_) => CallbackType::Signal,
        })
    }

    fn identifiers(&self) -> Vec<CallbackId> {
        let mut ids: Vec<CallbackId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    fn raise_signal(&mut self, signal: i32) {
        for entry in self.entries.values_mut() {
            if entry.kind == Kind::Signal(signal) {
                entry.pending_signals += 1;
            }
        }
    }

    fn take_ready(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut ready = Vec::new();

        // Deferred closures queued before this tick
        let queued: Vec<CallbackId> = self.deferred.drain(..).collect();
        for id in queued {
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(callback) = entry.callback.take() {
                    ready.push(Dispatch {
                        id,
                        signal: None,
                        callback,
                    });
                }
            }
        }

        // Signal deliveries, in registration order
        let mut watchers: Vec<CallbackId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.pending_signals > 0 && entry.callback.is_some())
            .map(|(id, _)| *id)
            .collect();
        watchers.sort();
        for id in watchers {
            if let Some(entry) = self.entries.get_mut(&id) {
                if let (Kind::Signal(signal), Some(callback)) = (entry.kind, entry.callback.take()) {
                    entry.pending_signals -= 1;
                    ready.push(Dispatch {
                        id,
                        signal: Some(signal),
                        callback,
                    });
                }
            }
        }

        // Due timers by deadline
        while let Some(timer) = self.timers.peek() {
            if timer.deadline > now {
                break;
            }
            let timer = match self.timers.pop() {
                Some(timer) => timer,
                None => break,
            };
            if !self.is_live(&timer) {
                continue;
            }
            if let Some(callback) = self
                .entries
                .get_mut(&timer.id)
                .and_then(|entry| entry.callback.take())
            {
                ready.push(Dispatch {
                    id: timer.id,
                    signal: None,
                    callback,
                });
            }
        }

        ready
    }

    fn complete(&mut self, id: CallbackId) {
        self.entries.remove(&id);
    }

    fn rearm(&mut self, id: CallbackId, callback: Callback, now: Instant) {
        let interval = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.callback = Some(callback);
                match entry.kind {
                    Kind::Repeat(interval) => Some(interval),
                    _ => None,
                }
            }
            // Cancelled while running
            None => return,
        };
        if let Some(interval) = interval {
            self.arm(id, now + interval);
        }
    }

    fn restore(&mut self, id: CallbackId, callback: Callback) {
        let kind = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.callback = Some(callback);
                entry.kind
            }
            None => return,
        };
        match kind {
            Kind::Defer => self.deferred.push_front(id),
            Kind::Delay | Kind::Repeat(_) => self.arm(id, Instant::now()),
            Kind::Signal(_) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.pending_signals += 1;
                }
            }
        }
    }

    fn has_ready(&self, now: Instant) -> bool {
        if self
            .deferred
            .iter()
            .any(|id| self.entries.get(id).map_or(false, |e| e.callback.is_some()))
        {
            return true;
        }
        if self
            .entries
            .values()
            .any(|entry| entry.pending_signals > 0 && entry.callback.is_some())
        {
            return true;
        }
        self.timers
            .iter()
            .any(|timer| timer.deadline <= now && self.is_live(timer))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter(|timer| self.is_live(timer))
            .map(|timer| timer.deadline)
            .min()
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}
